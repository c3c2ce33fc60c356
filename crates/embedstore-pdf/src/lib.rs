//! PDF loading for embedstore.
//!
//! [`PdfLoader`] extracts text with `pdf-extract` from a file or from bytes already in
//! memory, either as one document or as one document per page.

mod loader;

pub use embedstore_core::{Document, Loader};
pub use loader::PdfLoader;
