mod paragraph;

pub use paragraph::ParagraphSplitter;

pub use embedstore_core::Document;

/// Metadata key holding a chunk's position within its source document.
pub const INDEX_METADATA_KEY: &str = "index";

/// Trait for splitting text into chunks.
pub trait TextSplitter: Send + Sync {
    /// Split a string into chunks.
    fn split_text(&self, text: &str) -> Vec<String>;

    /// Split each document into one document per chunk. Metadata is copied onto
    /// every chunk and [`INDEX_METADATA_KEY`] records the chunk position.
    fn split_documents(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut result = Vec::new();
        for doc in docs {
            let chunks = self.split_text(&doc.content);
            for (i, chunk) in chunks.into_iter().enumerate() {
                let mut metadata = doc.metadata.clone();
                metadata.insert(
                    INDEX_METADATA_KEY.to_string(),
                    serde_json::Value::Number(i.into()),
                );
                result.push(Document::with_metadata(
                    format!("{}-{i}", doc.id),
                    chunk,
                    metadata,
                ));
            }
        }
        result
    }
}
