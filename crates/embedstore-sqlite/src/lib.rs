//! SQLite backend for embedstore.
//!
//! [`SqliteDatabase`] implements [`Database`](embedstore_core::Database) over a single
//! `rusqlite` connection. Open it with `TableStore::open` from `embedstore-sql`,
//! which selects the generic dialect for SQLite.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use embedstore_sql::{OpenOptions, TableStore};
//! use embedstore_sqlite::SqliteDatabase;
//!
//! let db = Arc::new(SqliteDatabase::in_memory()?);
//! let store = TableStore::open(db, &OpenOptions::new("docs", 384)).await?;
//! ```

mod database;

pub use database::SqliteDatabase;
