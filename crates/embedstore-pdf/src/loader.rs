use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use embedstore_core::{Document, EmbedStoreError, Loader};
use serde_json::Value;

#[derive(Clone)]
enum PdfSource {
    Path(PathBuf),
    Bytes { name: String, bytes: Vec<u8> },
}

impl PdfSource {
    fn name(&self) -> String {
        match self {
            PdfSource::Path(path) => path.to_string_lossy().to_string(),
            PdfSource::Bytes { name, .. } => name.clone(),
        }
    }
}

/// Loads documents from a PDF.
///
/// - **Single document** (default): all pages are combined into one `Document`.
/// - **Split pages**: each non-empty page becomes a `Document`, split on the form
///   feed characters (`\x0c`) that `pdf_extract` inserts between pages.
///
/// Every document carries `source` and `total_pages` metadata; split pages also
/// carry a 1-based `page`.
///
/// # Examples
///
/// ```no_run
/// use embedstore_pdf::{Loader, PdfLoader};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let docs = PdfLoader::new("manual.pdf").with_split_pages(true).load().await?;
/// # Ok(())
/// # }
/// ```
pub struct PdfLoader {
    source: PdfSource,
    split_pages: bool,
}

impl PdfLoader {
    /// Load the PDF at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            source: PdfSource::Path(path.into()),
            split_pages: false,
        }
    }

    /// Load a PDF that is already in memory. `name` becomes the `source` metadata.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source: PdfSource::Bytes {
                name: name.into(),
                bytes,
            },
            split_pages: false,
        }
    }

    pub fn with_split_pages(mut self, split_pages: bool) -> Self {
        self.split_pages = split_pages;
        self
    }

    async fn extract(&self) -> Result<String, EmbedStoreError> {
        let source = self.source.clone();
        let name = self.source.name();

        // pdf_extract is synchronous, so run it on a blocking thread
        tokio::task::spawn_blocking(move || match source {
            PdfSource::Path(path) => pdf_extract::extract_text(&path),
            PdfSource::Bytes { bytes, .. } => pdf_extract::extract_text_from_mem(&bytes),
        })
        .await
        .map_err(|e| EmbedStoreError::Loader(format!("task join error for {name}: {e}")))?
        .map_err(|e| EmbedStoreError::Loader(format!("failed to extract text from {name}: {e}")))
    }
}

#[async_trait]
impl Loader for PdfLoader {
    async fn load(&self) -> Result<Vec<Document>, EmbedStoreError> {
        let text = self.extract().await?;
        let source = self.source.name();
        let pages: Vec<&str> = text.split('\x0c').collect();
        let total_pages = pages.len();

        if !self.split_pages {
            let mut metadata = HashMap::new();
            metadata.insert("source".to_string(), Value::String(source.clone()));
            metadata.insert("total_pages".to_string(), Value::from(total_pages));
            return Ok(vec![Document::with_metadata(source, text.trim(), metadata)]);
        }

        Ok(pages
            .into_iter()
            .enumerate()
            .filter(|(_, content)| !content.trim().is_empty())
            .map(|(i, content)| {
                let page = i + 1;
                let mut metadata = HashMap::new();
                metadata.insert("source".to_string(), Value::String(source.clone()));
                metadata.insert("page".to_string(), Value::from(page));
                metadata.insert("total_pages".to_string(), Value::from(total_pages));
                Document::with_metadata(format!("{source}:page_{page}"), content.trim(), metadata)
            })
            .collect())
    }
}
