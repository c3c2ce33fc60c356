mod file_loader;
mod text_loader;

pub use file_loader::FileLoader;
pub use text_loader::TextLoader;

pub use embedstore_core::{Document, Loader};
