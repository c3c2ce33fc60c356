//! Embedstore: a relational embedding store with background embedding.
//!
//! [`EmbeddingStore`] embeds text on a [`TaskScheduler`], writes one row per segment
//! into a SQL table, and makes every search wait for the embedding jobs queued before
//! it. The sub-crates are re-exported so a single dependency is enough.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `default` | `sqlite` |
//! | `sqlite` | Embedded SQLite backend (`SqliteDatabase`) |
//! | `pgvector` | PostgreSQL + pgvector backend (`PgDatabase`) |
//! | `pdf` | PDF document loader |
//! | `full` | All features enabled |
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use embedstore::{EmbeddingStore, Metadata, embeddings::FakeEmbeddings, sqlite::SqliteDatabase};
//! use serde_json::json;
//!
//! let db = Arc::new(SqliteDatabase::in_memory()?);
//! let store = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(8)))
//!     .table_name("docs")
//!     .metadata_column("doc_id")
//!     .store_text(true)
//!     .build()
//!     .await?;
//!
//! let mut metadata = Metadata::new();
//! metadata.insert("doc_id".into(), json!("greeting"));
//! let _job = store.embed(["hello world"], Some(vec![metadata]));
//! let matches = store.search("hello", 5, None).await?;
//! ```

mod config;
mod coordinator;
mod scheduler;
mod store;

pub use config::{StoreConfig, ENV_DRAIN_TIMEOUT_MS, ENV_EMBEDDING_LIST_SIZE};
pub use coordinator::{PendingGuard, PendingTracker};
pub use scheduler::{ManualScheduler, TaskScheduler, TokioScheduler};
pub use store::{EmbedJob, EmbeddingStore, EmbeddingStoreBuilder, SearchQuery};

pub use embedstore_core::{
    ColumnFlags, ColumnKind, Document, EmbedStoreError, Embeddings, Loader, MetaDataKey, Metadata,
    MetadataFilter, SearchMatch, SearchRequest, TextSegment, TransactionId,
};

/// Core model and traits: errors, metadata keys, search types, the `Database` seam.
/// Always available.
pub use embedstore_core as core;

/// Table engine: dialects, schema manager, write and search paths, `TableStore`.
pub use embedstore_sql as sql;

/// Embedding providers: `FakeEmbeddings`.
pub use embedstore_embeddings as embeddings;

/// Text splitters: `ParagraphSplitter`.
pub use embedstore_splitters as splitters;

/// Document loaders: `TextLoader`, `FileLoader`.
pub use embedstore_loaders as loaders;

/// Embedded SQLite backend.
#[cfg(feature = "sqlite")]
pub use embedstore_sqlite as sqlite;

/// PostgreSQL + pgvector backend.
#[cfg(feature = "pgvector")]
pub use embedstore_pgvector as pgvector;

/// PDF loader.
#[cfg(feature = "pdf")]
pub use embedstore_pdf as pdf;
