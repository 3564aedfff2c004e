use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::models::{Chunk, Page};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Split points in order of preference.
const SEPARATORS: [&str; 7] = ["\n\n", "\n", ". ", "; ", ": ", ", ", " "];

const PAGE_JOINER: &str = "\n\n";

struct Cleaners {
    spaces: Regex,
    indentation: Regex,
    blank_lines: Regex,
    control: Regex,
}

fn cleaners() -> &'static Cleaners {
    static CLEANERS: OnceLock<Cleaners> = OnceLock::new();
    CLEANERS.get_or_init(|| Cleaners {
        spaces: Regex::new(r"[ ]{2,}").expect("static pattern"),
        indentation: Regex::new(r"\n[ ]+").expect("static pattern"),
        blank_lines: Regex::new(r"\n{3,}").expect("static pattern"),
        control: Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f]").expect("static pattern"),
    })
}

/// Normalises extracted page text while keeping paragraph and line breaks.
pub fn clean_text(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let cleaners = cleaners();
    let text = value
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\t', " ")
        .replace('\u{a0}', " ");
    let text = cleaners.control.replace_all(&text, " ");
    let text = cleaners.spaces.replace_all(&text, " ");
    let text = cleaners.indentation.replace_all(&text, "\n");
    let text = cleaners.blank_lines.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[derive(Debug, Clone, Copy)]
struct PageRange {
    number: u32,
    start: usize,
    end: usize,
    degraded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Placeholder {
    number: u32,
    offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Splits one document's pages into bounded chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn chunk(&self, document_id: &str, source: &str, pages: &[Page]) -> Vec<Chunk> {
        let mut text: Vec<char> = Vec::new();
        let mut ranges = Vec::new();
        let mut placeholders = Vec::new();

        for page in pages {
            let cleaned = clean_text(&page.text);
            if cleaned.is_empty() {
                placeholders.push(Placeholder {
                    number: page.number,
                    offset: text.len(),
                });
                continue;
            }
            if !text.is_empty() {
                text.extend(PAGE_JOINER.chars());
            }
            let start = text.len();
            text.extend(cleaned.chars());
            ranges.push(PageRange {
                number: page.number,
                start,
                end: text.len(),
                degraded: page.degraded,
            });
        }

        let mut drafts = split_spans(&text, self.config)
            .into_iter()
            .map(|span| draft_for_span(&text, span, &ranges, &placeholders))
            .collect::<Vec<_>>();

        drafts.extend(placeholders.iter().map(|placeholder| Draft {
            text: String::new(),
            char_start: placeholder.offset,
            char_end: placeholder.offset,
            page_start: placeholder.number,
            page_end: placeholder.number,
            warning: true,
        }));

        drafts.sort_by_key(|draft| (draft.char_start, draft.page_start));

        drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let sequence_index = index as u64;
                Chunk {
                    chunk_id: make_chunk_id(document_id, draft.page_start, sequence_index, &draft.text),
                    document_id: document_id.to_string(),
                    source: source.to_string(),
                    sequence_index,
                    text: draft.text,
                    char_start: draft.char_start,
                    char_end: draft.char_end,
                    page_start: draft.page_start,
                    page_end: draft.page_end,
                    chunk_warning: draft.warning,
                }
            })
            .collect()
    }
}

struct Draft {
    text: String,
    char_start: usize,
    char_end: usize,
    page_start: u32,
    page_end: u32,
    warning: bool,
}

fn draft_for_span(
    text: &[char],
    span: Span,
    ranges: &[PageRange],
    placeholders: &[Placeholder],
) -> Draft {
    let overlapping = ranges
        .iter()
        .filter(|range| range.start < span.end && range.end > span.start)
        .collect::<Vec<_>>();

    let page_start = overlapping.iter().map(|range| range.number).min().unwrap_or(1);
    let page_end = overlapping
        .iter()
        .map(|range| range.number)
        .max()
        .unwrap_or(page_start);

    // An empty page sitting strictly inside the span is missing content of this chunk.
    let bridges_gap = placeholders
        .iter()
        .any(|placeholder| placeholder.offset > span.start && placeholder.offset < span.end);

    Draft {
        text: text[span.start..span.end].iter().collect(),
        char_start: span.start,
        char_end: span.end,
        page_start,
        page_end,
        warning: bridges_gap || overlapping.iter().any(|range| range.degraded),
    }
}

fn split_spans(text: &[char], config: ChunkingConfig) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < text.len() {
        let cut = if text.len() - start <= config.max_chars {
            text.len()
        } else {
            find_split(text, start, config)
        };

        if let Some(span) = trimmed(text, start, cut) {
            spans.push(span);
        }
        start = skip_whitespace(text, cut);
    }

    spans
}

/// Index where the next chunk begins: right after the last preferred
/// separator that fits inside the window without leaving a chunk shorter
/// than `min_chars` on either side, or a hard cut at the window end.
fn find_split(text: &[char], start: usize, config: ChunkingConfig) -> usize {
    let remaining = text.len() - start;
    let window_end = if remaining >= 2 * config.min_chars {
        (start + config.max_chars).min(text.len() - config.min_chars)
    } else {
        (start + config.max_chars).min(text.len())
    };
    let earliest = start + config.min_chars;

    for separator in SEPARATORS {
        let pattern = separator.chars().collect::<Vec<_>>();
        if window_end < earliest + pattern.len() {
            continue;
        }
        let latest = window_end - pattern.len();
        for position in (earliest..=latest).rev() {
            if text[position..position + pattern.len()] == pattern[..] {
                return position + pattern.len();
            }
        }
    }

    window_end
}

fn skip_whitespace(text: &[char], mut index: usize) -> usize {
    while index < text.len() && text[index].is_whitespace() {
        index += 1;
    }
    index
}

fn trimmed(text: &[char], start: usize, end: usize) -> Option<Span> {
    let start = skip_whitespace(text, start).min(end);
    let mut end = end;
    while end > start && text[end - 1].is_whitespace() {
        end -= 1;
    }
    (end > start).then_some(Span { start, end })
}

fn make_chunk_id(document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionMethod;

    fn page(number: u32, text: &str, degraded: bool) -> Page {
        Page {
            number,
            text: text.to_string(),
            method: if text.is_empty() {
                ExtractionMethod::None
            } else {
                ExtractionMethod::Direct
            },
            degraded,
            extraction_errors: Vec::new(),
        }
    }

    fn small_config() -> ChunkingConfig {
        ChunkingConfig {
            max_chars: 60,
            min_chars: 20,
        }
    }

    fn sentences(count: usize) -> String {
        (0..count)
            .map(|index| format!("Sentence number {index} explains dosing."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn clean_text_keeps_paragraphs() {
        let input = "Title\r\n\r\n\r\n   Body\twith\u{a0}  spacing\x07";
        assert_eq!(clean_text(input), "Title\n\nBody with spacing");
    }

    #[test]
    fn chunks_respect_max_and_prefer_sentence_breaks() -> Result<(), IngestError> {
        let chunker = Chunker::new(small_config())?;
        let chunks = chunker.chunk("doc", "guide.pdf", &[page(1, &sentences(6), false)]);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 60, "{}", chunk.text);
            assert!(!chunk.chunk_warning);
        }
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.text.ends_with('.'), "{}", chunk.text);
        }
        Ok(())
    }

    #[test]
    fn unbroken_text_is_cut_at_max() -> Result<(), IngestError> {
        let chunker = Chunker::new(small_config())?;
        let chunks = chunker.chunk("doc", "x", &[page(1, &"a".repeat(130), false)]);
        let lengths = chunks
            .iter()
            .map(|chunk| chunk.text.chars().count())
            .collect::<Vec<_>>();
        assert_eq!(lengths, vec![60, 50, 20]);
        Ok(())
    }

    #[test]
    fn split_point_moves_back_to_avoid_short_tail() -> Result<(), IngestError> {
        let chunker = Chunker::new(ChunkingConfig {
            max_chars: 50,
            min_chars: 10,
        })?;
        let text = format!("{} {}", "a".repeat(45), "b".repeat(8));
        let chunks = chunker.chunk("doc", "x", &[page(1, &text, false)]);
        let lengths = chunks
            .iter()
            .map(|chunk| chunk.text.chars().count())
            .collect::<Vec<_>>();
        assert_eq!(lengths, vec![44, 10]);
        Ok(())
    }

    #[test]
    fn no_chunk_falls_below_min_when_text_is_longer() -> Result<(), IngestError> {
        let config = ChunkingConfig {
            max_chars: 360,
            min_chars: 180,
        };
        let chunker = Chunker::new(config)?;
        for length in [361, 400, 539, 700, 1_081] {
            let chunks = chunker.chunk("doc", "x", &[page(1, &"a".repeat(length), false)]);
            for chunk in &chunks {
                let chars = chunk.text.chars().count();
                assert!((180..=360).contains(&chars), "{length}: {chars}");
            }
        }
        Ok(())
    }

    #[test]
    fn short_tail_configs_are_refused() {
        assert!(Chunker::new(ChunkingConfig {
            max_chars: 300,
            min_chars: 180,
        })
        .is_err());
    }

    #[test]
    fn chunking_is_deterministic() -> Result<(), IngestError> {
        let chunker = Chunker::new(small_config())?;
        let pages = vec![page(1, &sentences(5), false), page(2, &sentences(3), true)];
        assert_eq!(
            chunker.chunk("doc", "x", &pages),
            chunker.chunk("doc", "x", &pages)
        );
        Ok(())
    }

    #[test]
    fn empty_page_yields_warning_placeholder_only() -> Result<(), IngestError> {
        let chunker = Chunker::new(ChunkingConfig::default())?;
        let pages = vec![
            page(1, "Patient presents with abdominal pain and nausea since this morning.", false),
            page(2, "", true),
        ];
        let chunks = chunker.chunk("doc", "x", &pages);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_start, 1);
        assert!(!chunks[0].chunk_warning);
        assert_eq!(chunks[1].page_start, 2);
        assert!(chunks[1].chunk_warning);
        assert!(chunks[1].text.is_empty());
        assert_eq!(chunks[1].sequence_index, 1);
        Ok(())
    }

    #[test]
    fn chunks_spanning_degraded_pages_inherit_warning() -> Result<(), IngestError> {
        let chunker = Chunker::new(ChunkingConfig::default())?;
        let pages = vec![
            page(1, "First page has enough text to read.", false),
            page(2, "th1n", true),
        ];
        let chunks = chunker.chunk("doc", "x", &pages);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].page_start, chunks[0].page_end), (1, 2));
        assert!(chunks[0].chunk_warning);
        Ok(())
    }

    #[test]
    fn spans_point_into_assembled_text() -> Result<(), IngestError> {
        let chunker = Chunker::new(small_config())?;
        let pages = vec![page(1, &sentences(2), false), page(2, &sentences(2), false)];
        let chunks = chunker.chunk("doc", "x", &pages);
        for pair in chunks.windows(2) {
            assert!(pair[0].char_end <= pair[1].char_start);
        }
        for chunk in &chunks {
            assert_eq!(chunk.char_end - chunk.char_start, chunk.text.chars().count());
        }
        Ok(())
    }
}
