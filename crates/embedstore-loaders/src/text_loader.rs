use async_trait::async_trait;
use embedstore_core::{Document, EmbedStoreError, Loader, Metadata};

/// Serves one in-memory document.
pub struct TextLoader {
    id: String,
    content: String,
    metadata: Metadata,
}

impl TextLoader {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
impl Loader for TextLoader {
    async fn load(&self) -> Result<Vec<Document>, EmbedStoreError> {
        Ok(vec![Document::with_metadata(
            self.id.clone(),
            self.content.clone(),
            self.metadata.clone(),
        )])
    }
}
