use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use embedstore_core::{Document, EmbedStoreError, Loader};
use serde_json::Value;

/// Loads a UTF-8 text file as a single document.
///
/// The document id and the `source` metadata entry are both the file path.
pub struct FileLoader {
    path: PathBuf,
}

impl FileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Loader for FileLoader {
    async fn load(&self) -> Result<Vec<Document>, EmbedStoreError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EmbedStoreError::Loader(format!("cannot read {}: {e}", self.path.display()))
        })?;

        let source = self.path.to_string_lossy().to_string();
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), Value::String(source.clone()));

        Ok(vec![Document::with_metadata(source, content, metadata)])
    }
}
