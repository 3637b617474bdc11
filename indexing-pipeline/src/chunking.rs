use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::error::AppError;
use text_splitter::{ChunkCapacity, ChunkConfig, TextSplitter};
use tracing::debug;

/// One span of text bound for embedding. The ordinal is stable within a
/// document and doubles as the correlation key for batch jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub ordinal: usize,
    pub text: String,
    pub page_numbers: Option<Vec<u32>>,
}

/// Intermediate form between a source file and its chunks: the extracted
/// text, split into sections that remember which page they came from.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub source: PathBuf,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub text: String,
    pub page: Option<u32>,
}

/// Conversion and chunking boundary. The pipeline never looks inside;
/// swapping in a semantic chunker means implementing this trait.
#[async_trait]
pub trait ChunkProducer: Send + Sync {
    async fn convert(&self, path: &Path) -> Result<ExtractedDocument, AppError>;

    fn chunk(&self, document: &ExtractedDocument) -> Result<Vec<Chunk>, AppError>;

    async fn chunk_file(&self, path: &Path) -> Result<Vec<Chunk>, AppError> {
        let document = self.convert(path).await?;
        self.chunk(&document)
    }
}

/// Character-capacity splitter over plain text and PDF text layers.
/// Formats it recognizes but cannot convert (currently `.docx`) come back
/// as `Conversion` errors, which the pipeline logs and skips.
pub struct DocumentChunker {
    min_chars: usize,
    max_chars: usize,
}

impl Default for DocumentChunker {
    fn default() -> Self {
        Self {
            min_chars: 500,
            max_chars: 2_000,
        }
    }
}

impl DocumentChunker {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            min_chars,
            max_chars,
        }
    }

    fn split_text(&self, text: &str) -> Result<Vec<String>, AppError> {
        if self.min_chars == 0 || self.min_chars > self.max_chars {
            return Err(AppError::Validation(
                "invalid chunk bounds; ensure 0 < min <= max".into(),
            ));
        }

        let capacity = ChunkCapacity::new(self.min_chars)
            .with_max(self.max_chars)
            .map_err(|e| AppError::Validation(format!("invalid chunk bounds: {e}")))?;
        let splitter = TextSplitter::new(ChunkConfig::new(capacity));

        Ok(splitter.chunks(text).map(str::to_owned).collect())
    }
}

#[async_trait]
impl ChunkProducer for DocumentChunker {
    async fn convert(&self, path: &Path) -> Result<ExtractedDocument, AppError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let sections = match extension.as_str() {
            "txt" | "md" => {
                let text = tokio::fs::read_to_string(path).await?;
                vec![Section { text, page: None }]
            }
            "pdf" => extract_pdf_sections(path).await?,
            "docx" => {
                return Err(AppError::Conversion(format!(
                    "no converter available for docx file {}",
                    path.display()
                )));
            }
            other => {
                return Err(AppError::Conversion(format!(
                    "unsupported file extension '{other}' for {}",
                    path.display()
                )));
            }
        };

        Ok(ExtractedDocument {
            source: path.to_path_buf(),
            sections,
        })
    }

    fn chunk(&self, document: &ExtractedDocument) -> Result<Vec<Chunk>, AppError> {
        let mut chunks = Vec::new();

        for section in &document.sections {
            if section.text.trim().is_empty() {
                continue;
            }
            for text in self.split_text(&section.text)? {
                chunks.push(Chunk {
                    ordinal: chunks.len(),
                    text,
                    page_numbers: section.page.map(|p| vec![p]),
                });
            }
        }

        debug!(
            source = %document.source.display(),
            chunks = chunks.len(),
            "document chunked"
        );

        Ok(chunks)
    }
}

/// Pulls the text layer out of a PDF one page at a time, keeping work off
/// the async executor. Pages without extractable text are dropped.
async fn extract_pdf_sections(path: &Path) -> Result<Vec<Section>, AppError> {
    let path = path.to_path_buf();
    let pages = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_by_pages(&path)
            .map_err(|err| AppError::Conversion(format!("failed to extract PDF text: {err}")))
    })
    .await??;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(idx, text)| Section {
            text,
            page: u32::try_from(idx.saturating_add(1)).ok(),
        })
        .collect())
}
