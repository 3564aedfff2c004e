use crate::models::{Citation, CitationSpan, ScoredChunk};

/// One citation per document, in order of first appearance, listing every
/// span of that document present in `used`.
pub fn assemble_citations(used: &[ScoredChunk]) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();

    for hit in used {
        let chunk = &hit.chunk;
        let span = CitationSpan {
            chunk_id: chunk.chunk_id.clone(),
            sequence_index: chunk.sequence_index,
            page_start: chunk.page_start,
            page_end: chunk.page_end,
            char_start: chunk.char_start,
            char_end: chunk.char_end,
        };

        match citations
            .iter_mut()
            .find(|citation| citation.document_id == chunk.document_id)
        {
            Some(citation) => {
                if !citation.spans.iter().any(|existing| existing.chunk_id == span.chunk_id) {
                    citation.spans.push(span);
                }
            }
            None => citations.push(Citation {
                document_id: chunk.document_id.clone(),
                source: chunk.source.clone(),
                spans: vec![span],
            }),
        }
    }

    citations
}
