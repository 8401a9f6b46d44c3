//! División de documentos en ventanas solapadas de tamaño fijo.
//!
//! Las longitudes y offsets se miden en caracteres (no en bytes) para que
//! el corte nunca caiga dentro de un carácter UTF-8 multibyte.

use crate::error::{PipelineError, Result};
use crate::models::{Chunk, Document};

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
    overlap: usize,
}

impl Chunker {
    /// Valida la configuración una sola vez (en el arranque).
    pub fn new(max_chars: usize, overlap: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(PipelineError::Configuration(
                "el tamaño máximo de chunk debe ser mayor que 0".into(),
            ));
        }
        if overlap >= max_chars {
            return Err(PipelineError::Configuration(format!(
                "el solapamiento ({overlap}) debe ser menor que el tamaño de chunk ({max_chars})"
            )));
        }
        Ok(Self { max_chars, overlap })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Desplazamiento entre inicios de chunks consecutivos.
    pub fn stride(&self) -> usize {
        self.max_chars - self.overlap
    }

    /// Divide el texto del documento en chunks ordenados y sin huecos.
    ///
    /// Cada chunk empieza en `anterior + (max - overlap)` y mide como mucho
    /// `max` caracteres; el último puede ser más corto. Un texto vacío no
    /// produce chunks.
    pub fn split(&self, doc: &Document) -> Vec<Chunk> {
        // Offsets en bytes de cada carácter, más el final del texto.
        let boundaries: Vec<usize> = doc
            .text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(doc.text.len()))
            .collect();
        let total = boundaries.len() - 1;

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + self.max_chars).min(total);
            chunks.push(Chunk {
                text: doc.text[boundaries[start]..boundaries[end]].to_string(),
                start,
                end,
                parent_path: doc.path.clone(),
                file_type: doc.file_type,
                file_size: doc.size(),
            });
            if end == total {
                break;
            }
            start += self.stride();
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;

    fn doc(text: &str) -> Document {
        Document::new("README.md", text)
    }

    /// Reconstruye el texto original a partir de los chunks y sus offsets.
    fn reconstruct(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for chunk in chunks {
            let skip = covered - chunk.start;
            out.extend(chunk.text.chars().skip(skip));
            covered = chunk.end;
        }
        out
    }

    #[test]
    fn readme_scenario_offsets() {
        let text = "a".repeat(1000);
        let chunks = Chunker::new(400, 50).unwrap().split(&doc(&text));

        let starts: Vec<usize> = chunks.iter().map(|c| c.start).collect();
        let lengths: Vec<usize> = chunks.iter().map(Chunk::char_len).collect();
        assert_eq!(starts, vec![0, 350, 700]);
        assert_eq!(lengths, vec![400, 400, 300]);
        assert_eq!(chunks.last().unwrap().end, 1000);
    }

    #[test]
    fn short_text_yields_single_chunk() {
        let chunks = Chunker::new(400, 50).unwrap().split(&doc("hola"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hola");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 4));
    }

    #[test]
    fn chunks_inherit_document_type_and_size() {
        let source = Document::new("src/vanna/base/base.py", "def run_sql(self, sql):\n".repeat(40));
        let chunks = Chunker::new(200, 20).unwrap().split(&source);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.file_type, FileType::Python);
            assert_eq!(chunk.file_size, source.text.len());
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(Chunker::new(400, 50).unwrap().split(&doc("")).is_empty());
    }

    #[test]
    fn invalid_sizes_are_configuration_errors() {
        assert!(matches!(Chunker::new(0, 0), Err(PipelineError::Configuration(_))));
        assert!(matches!(Chunker::new(100, 100), Err(PipelineError::Configuration(_))));
        assert!(matches!(Chunker::new(100, 150), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn chunking_is_lossless_and_overlaps_exactly() {
        let text: String = (0..2_345)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        for (max, overlap) in [(400, 50), (100, 0), (64, 63), (1000, 200), (7, 3)] {
            let chunks = Chunker::new(max, overlap).unwrap().split(&doc(&text));
            assert_eq!(reconstruct(&chunks), text, "max={max} overlap={overlap}");

            for pair in chunks.windows(2) {
                let (prev, next) = (&pair[0], &pair[1]);
                assert_eq!(next.start, prev.start + (max - overlap));
                assert_eq!(prev.char_len(), max);
                let tail: String = prev.text.chars().skip(max - overlap).collect();
                let head: String = next.text.chars().take(overlap).collect();
                assert_eq!(tail, head);
            }
            assert!(chunks.iter().all(|c| !c.text.is_empty() && c.char_len() <= max));
        }
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "ñandú ☕ código ".repeat(40);
        let chunks = Chunker::new(33, 5).unwrap().split(&doc(&text));
        assert_eq!(reconstruct(&chunks), text);
        assert!(chunks.iter().all(|c| c.text.chars().count() == c.char_len()));
    }
}
