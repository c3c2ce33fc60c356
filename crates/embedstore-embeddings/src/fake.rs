use async_trait::async_trait;
use embedstore_core::{EmbedStoreError, Embeddings};

/// Deterministic embeddings for testing.
///
/// Each byte of the text is added to the slot `index % dimension`, then the vector is
/// normalized, so identical texts always map to identical unit vectors.
#[derive(Debug, Clone)]
pub struct FakeEmbeddings {
    dimension: usize,
}

impl FakeEmbeddings {
    /// # Panics
    ///
    /// Panics if `dimension` is zero.
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "dimension must be > 0");
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Default for FakeEmbeddings {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl Embeddings for FakeEmbeddings {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedStoreError> {
        Ok(texts
            .iter()
            .map(|t| text_to_vector(t, self.dimension))
            .collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedStoreError> {
        Ok(text_to_vector(text, self.dimension))
    }
}

fn text_to_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension];
    for (i, byte) in text.bytes().enumerate() {
        vec[i % dimension] += byte as f32;
    }
    let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in &mut vec {
            *x /= magnitude;
        }
    }
    vec
}
