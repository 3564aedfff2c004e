use crate::config::ExtractionConfig;
use crate::error::IngestError;
use crate::models::{Document, DocumentFormat, ExtractionMethod, Page};
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document as PdfDocument;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

/// Maximum decompressed bytes read from `word/document.xml`.
const MAX_DOCX_XML_BYTES: u64 = 50 * 1024 * 1024;

/// Text-layer access to a document.
pub trait DirectExtractor: Send + Sync {
    /// Parses the document once and returns every page's text in order.
    /// The outer error means the document could not be paginated at all; an
    /// inner error only concerns that page.
    fn extract_pages(
        &self,
        document: &Document,
    ) -> Result<Vec<Result<String, IngestError>>, IngestError>;
}

/// OCR black box used when the text layer is too thin.
pub trait OcrEngine: Send + Sync {
    fn page_count(&self, document: &Document) -> Result<u32, IngestError>;
    fn extract_ocr(&self, document: &Document, page: u32) -> Result<String, IngestError>;
}

/// Reads the text layer of every supported format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatExtractor;

impl DirectExtractor for FormatExtractor {
    fn extract_pages(
        &self,
        document: &Document,
    ) -> Result<Vec<Result<String, IngestError>>, IngestError> {
        match document.format {
            DocumentFormat::Pdf => {
                let pdf = PdfDocument::load_mem(&document.bytes)
                    .map_err(|error| IngestError::PdfParse(error.to_string()))?;
                Ok(pdf
                    .get_pages()
                    .keys()
                    .map(|&number| {
                        pdf.extract_text(&[number])
                            .map_err(|error| IngestError::PdfParse(error.to_string()))
                    })
                    .collect())
            }
            DocumentFormat::Docx => Ok(docx_pages(&document.bytes)?.into_iter().map(Ok).collect()),
            DocumentFormat::Text => Ok(text_pages(&document.bytes).into_iter().map(Ok).collect()),
        }
    }
}

fn text_pages(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let pages = text
        .split('\u{000c}')
        .map(|page| page.to_string())
        .collect::<Vec<_>>();
    if pages.is_empty() {
        vec![String::new()]
    } else {
        pages
    }
}

/// Paragraph text grouped into pages on explicit `<w:br w:type="page"/>` breaks.
pub(crate) fn docx_pages(bytes: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|error| IngestError::DocxParse(error.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|error| IngestError::DocxParse(format!("word/document.xml: {error}")))?;
    let mut xml = Vec::new();
    entry.take(MAX_DOCX_XML_BYTES).read_to_end(&mut xml)?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err(IngestError::DocxParse(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut pages = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut paragraph: Vec<String> = Vec::new();
    let mut in_text = false;
    let mut page_break = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"t" => in_text = true,
                b"br" if is_page_break(&element) => page_break = true,
                _ => {}
            },
            Ok(Event::Empty(element)) => {
                if element.local_name().as_ref() == b"br" && is_page_break(&element) {
                    page_break = true;
                }
            }
            Ok(Event::Text(text)) if in_text => {
                let value = text
                    .unescape()
                    .map_err(|error| IngestError::DocxParse(error.to_string()))?;
                paragraph.push(value.into_owned());
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let joined = paragraph.join(" ").trim().to_string();
                    paragraph.clear();
                    if !joined.is_empty() {
                        current.push(joined);
                    }
                    if page_break {
                        let combined = current.join("\n").trim().to_string();
                        if !combined.is_empty() {
                            pages.push(combined);
                        }
                        current.clear();
                        page_break = false;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::DocxParse(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let remaining = current.join("\n").trim().to_string();
    if !remaining.is_empty() {
        pages.push(remaining);
    }
    if pages.is_empty() {
        pages.push(String::new());
    }
    Ok(pages)
}

fn is_page_break(element: &quick_xml::events::BytesStart<'_>) -> bool {
    element.attributes().flatten().any(|attribute| {
        attribute.key.local_name().as_ref() == b"type" && attribute.value.as_ref() == b"page"
    })
}

/// OCR path that is never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOcr;

impl OcrEngine for NoOcr {
    fn page_count(&self, _document: &Document) -> Result<u32, IngestError> {
        Err(IngestError::OcrFailed("no OCR engine configured".to_string()))
    }

    fn extract_ocr(&self, _document: &Document, _page: u32) -> Result<String, IngestError> {
        Ok(String::new())
    }
}

/// Rasterises a PDF page with `pdftoppm` and reads it back with `tesseract`.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pub pdftoppm: PathBuf,
    pub tesseract: PathBuf,
    pub languages: String,
    pub dpi: u32,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            pdftoppm: PathBuf::from("pdftoppm"),
            tesseract: PathBuf::from("tesseract"),
            languages: "spa+eng".to_string(),
            dpi: 300,
        }
    }
}

impl OcrEngine for TesseractOcr {
    fn page_count(&self, document: &Document) -> Result<u32, IngestError> {
        if document.format != DocumentFormat::Pdf {
            return Err(IngestError::OcrFailed(format!(
                "tesseract OCR only handles pdf, got {:?}",
                document.format
            )));
        }
        let workdir = tempdir()?;
        let input = workdir.join("input.pdf");
        std::fs::write(&input, &document.bytes)?;
        let prefix = workdir.join("page");
        run_tool(
            Command::new(&self.pdftoppm)
                .arg("-png")
                .arg("-r")
                .arg("36")
                .arg(&input)
                .arg(&prefix),
            "pdftoppm",
        )?;
        let count = std::fs::read_dir(&workdir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
            .count();
        let _ = std::fs::remove_dir_all(&workdir);
        if count == 0 {
            return Err(IngestError::OcrFailed("pdftoppm produced no images".to_string()));
        }
        Ok(count as u32)
    }

    fn extract_ocr(&self, document: &Document, page: u32) -> Result<String, IngestError> {
        if document.format != DocumentFormat::Pdf {
            return Ok(String::new());
        }
        let workdir = tempdir()?;
        let result = self.ocr_page_in(&workdir, document, page);
        let _ = std::fs::remove_dir_all(&workdir);
        result
    }
}

impl TesseractOcr {
    fn ocr_page_in(
        &self,
        workdir: &std::path::Path,
        document: &Document,
        page: u32,
    ) -> Result<String, IngestError> {
        let input = workdir.join("input.pdf");
        std::fs::write(&input, &document.bytes)?;
        let prefix = workdir.join("page");
        run_tool(
            Command::new(&self.pdftoppm)
                .arg("-png")
                .arg("-singlefile")
                .arg("-r")
                .arg(self.dpi.to_string())
                .arg("-f")
                .arg(page.to_string())
                .arg("-l")
                .arg(page.to_string())
                .arg(&input)
                .arg(&prefix),
            "pdftoppm",
        )?;
        let image = prefix.with_extension("png");
        run_tool(
            Command::new(&self.tesseract)
                .arg(&image)
                .arg("stdout")
                .arg("-l")
                .arg(&self.languages),
            "tesseract",
        )
    }
}

fn tempdir() -> Result<PathBuf, IngestError> {
    let dir = std::env::temp_dir().join(format!("kb-ocr-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn run_tool(command: &mut Command, name: &str) -> Result<String, IngestError> {
    let output = command.output().map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            IngestError::OcrFailed(format!("{name}_not_found"))
        } else {
            IngestError::OcrFailed(format!("{name}: {error}"))
        }
    })?;
    if !output.status.success() {
        return Err(IngestError::OcrFailed(format!(
            "{name}_failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// Multimodal OCR service reached over HTTP. The endpoint and key come from
/// the caller; this type never reads the environment.
pub struct HttpOcr {
    config: OcrEndpointConfig,
}

impl HttpOcr {
    pub fn new(config: OcrEndpointConfig) -> Self {
        Self { config }
    }

    fn request(&self, document: &Document, page: Option<u32>) -> Result<LlmOcrResponse, IngestError> {
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(&document.bytes),
            source_path: document.source.clone(),
            page,
        };

        // Built per call: the blocking client must not be created on an async worker.
        let mut request = Client::new()
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        Ok(response.json()?)
    }
}

impl OcrEngine for HttpOcr {
    fn page_count(&self, document: &Document) -> Result<u32, IngestError> {
        let payload = self.request(document, None)?;
        let pages = payload_to_pages(&payload);
        pages
            .iter()
            .map(|(number, _)| *number)
            .max()
            .ok_or_else(|| {
                IngestError::OcrFailed(format!(
                    "multimodal OCR response was empty for {}",
                    document.source
                ))
            })
    }

    fn extract_ocr(&self, document: &Document, page: u32) -> Result<String, IngestError> {
        let payload = self.request(document, Some(page))?;
        let pages = payload_to_pages(&payload);
        let exact = pages
            .iter()
            .find(|(number, _)| *number == page)
            .map(|(_, text)| text.clone());
        Ok(exact
            .or_else(|| {
                if pages.len() == 1 {
                    pages.into_iter().next().map(|(_, text)| text)
                } else {
                    None
                }
            })
            .unwrap_or_default())
    }
}

fn payload_to_pages(payload: &LlmOcrResponse) -> Vec<(u32, String)> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_ref().map(|value| value.trim().to_string());
                text.and_then(|normalized| {
                    if normalized.is_empty() {
                        None
                    } else {
                        Some((page.page.unwrap_or(1), normalized))
                    }
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return listed;
        }
    }

    payload
        .text
        .as_deref()
        .map(|raw_text| {
            raw_text
                .split('\u{000c}')
                .enumerate()
                .filter_map(|(index, chunk)| {
                    let normalized = chunk.trim().to_string();
                    if normalized.is_empty() {
                        None
                    } else {
                        Some(((index + 1) as u32, normalized))
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Text yield of a page, judged before chunking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Density {
    pub visible_chars: usize,
    pub alnum_ratio: f32,
}

impl Density {
    pub fn measure(text: &str) -> Self {
        let mut visible = 0usize;
        let mut alnum = 0usize;
        for ch in text.chars().filter(|ch| !ch.is_whitespace()) {
            visible += 1;
            if ch.is_alphanumeric() {
                alnum += 1;
            }
        }
        let alnum_ratio = if visible == 0 {
            0.0
        } else {
            alnum as f32 / visible as f32
        };
        Self {
            visible_chars: visible,
            alnum_ratio,
        }
    }

    pub fn is_sufficient(&self, config: &ExtractionConfig) -> bool {
        self.visible_chars > 0
            && self.visible_chars >= config.min_page_chars
            && self.alnum_ratio >= config.min_alnum_ratio
    }

    fn better_than(&self, other: &Density) -> bool {
        self.visible_chars as f32 * self.alnum_ratio > other.visible_chars as f32 * other.alnum_ratio
    }
}

/// Owns the direct-versus-OCR decision for each page.
pub struct TextExtractor {
    direct: Box<dyn DirectExtractor>,
    ocr: Box<dyn OcrEngine>,
    config: ExtractionConfig,
}

impl TextExtractor {
    pub fn new(
        direct: impl DirectExtractor + 'static,
        ocr: impl OcrEngine + 'static,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            direct: Box::new(direct),
            ocr: Box::new(ocr),
            config,
        }
    }

    /// Never fails: pages that produce nothing through either path come back
    /// empty with `degraded` set and the reasons in `extraction_errors`.
    pub fn extract(&self, document: &Document) -> Vec<Page> {
        let direct = match self.direct.extract_pages(document) {
            Ok(pages) if !pages.is_empty() => pages
                .into_iter()
                .map(|page| page.map_err(|error| vec![format!("direct: {error}")]))
                .collect::<Vec<_>>(),
            outcome => {
                let reason = match outcome {
                    Err(error) => format!("direct: {error}"),
                    Ok(_) => "direct: document has no pages".to_string(),
                };
                warn!(
                    document_id = %document.document_id,
                    source = %document.source,
                    %reason,
                    "direct pagination failed, asking OCR engine"
                );
                self.ocr_pagination(document, reason)
            }
        };

        direct
            .into_iter()
            .zip(1u32..)
            .map(|(direct, number)| self.extract_page(document, number, direct))
            .collect()
    }

    /// Page slots when only the OCR engine can say how many pages exist.
    fn ocr_pagination(&self, document: &Document, reason: String) -> Vec<Result<String, Vec<String>>> {
        match self.ocr.page_count(document) {
            Ok(count) if count > 0 => vec![Err(vec![reason]); count as usize],
            Ok(_) => vec![Err(vec![reason])],
            Err(error) => {
                warn!(
                    document_id = %document.document_id,
                    %error,
                    "document could not be paginated, keeping a single empty page"
                );
                vec![Err(vec![reason, format!("ocr: {error}")])]
            }
        }
    }

    fn extract_page(
        &self,
        document: &Document,
        number: u32,
        direct: Result<String, Vec<String>>,
    ) -> Page {
        let (direct, mut errors) = match direct {
            Ok(text) => (text, Vec::new()),
            Err(errors) => {
                debug!(document_id = %document.document_id, page = number, ?errors, "direct extraction failed");
                (String::new(), errors)
            }
        };
        let direct_density = Density::measure(&direct);

        if direct_density.is_sufficient(&self.config) {
            return Page {
                number,
                text: direct,
                method: ExtractionMethod::Direct,
                degraded: false,
                extraction_errors: errors,
            };
        }

        debug!(
            document_id = %document.document_id,
            page = number,
            visible_chars = direct_density.visible_chars,
            alnum_ratio = direct_density.alnum_ratio,
            "direct text below density threshold, trying OCR"
        );

        let ocr = match self.ocr.extract_ocr(document, number) {
            Ok(text) => text,
            Err(error) => {
                warn!(document_id = %document.document_id, page = number, %error, "ocr extraction failed");
                errors.push(format!("ocr: {error}"));
                String::new()
            }
        };
        let ocr_density = Density::measure(&ocr);

        let (text, method, density) = if ocr_density.better_than(&direct_density) {
            (ocr, ExtractionMethod::Ocr, ocr_density)
        } else if direct_density.visible_chars > 0 {
            (direct, ExtractionMethod::Direct, direct_density)
        } else {
            (String::new(), ExtractionMethod::None, direct_density)
        };

        Page {
            number,
            text,
            method,
            degraded: !density.is_sufficient(&self.config),
            extraction_errors: errors,
        }
    }
}
