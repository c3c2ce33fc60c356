//! Relational embeddings table engine.
//!
//! [`TableStore::open`] detects the backend behind a [`Database`](embedstore_core::Database),
//! picks its [`Dialect`], and resolves or creates the table through the
//! [`SchemaManager`]. The returned handle writes batches with delete-then-insert
//! upserts and answers similarity searches.
//!
//! ```rust,ignore
//! use embedstore_core::{MetaDataKey, SearchRequest, TextSegment};
//! use embedstore_sql::{OpenOptions, TableStore};
//!
//! let options = OpenOptions::new("docs", 3).metadata_key(MetaDataKey::text("doc_id"));
//! let store = TableStore::open(db, &options).await?;
//! store.add(vec![1.0, 0.0, 0.0], Some(TextSegment::new("hello"))).await?;
//! let matches = store.search(&SearchRequest::new(vec![1.0, 0.0, 0.0])).await?;
//! ```

pub mod dialect;
pub mod schema;
pub mod search;
mod store;
pub mod writer;

pub use dialect::{dialect_for, Dialect, GenericDialect, PostgresDialect, VectorParam};
pub use schema::{
    validate_table_name, DerivedOptions, OpenOptions, SchemaManager, TableSchema,
    DEFAULT_EMBEDDING_LIST_SIZE, EMBEDDING_COLUMN, EMBEDDING_ID_COLUMN, SCORE_ALIAS, TEXT_COLUMN,
};
pub use store::TableStore;
