//! Embedding providers for embedstore.
//!
//! Real providers live with the application; this crate ships [`FakeEmbeddings`],
//! a deterministic provider for tests and demos.

mod fake;

pub use embedstore_core::Embeddings;
pub use fake::FakeEmbeddings;
