use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use embedstore_core::{
    format_vector, parse_vector, relevance_score, ColumnInfo, ColumnType, Database,
    DatabaseProduct, EmbedStoreError, SqlValue, Statement, TableInfo, TransactionId,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;
use uuid::Uuid;

struct Inner {
    conn: Connection,
    /// The transaction opened by [`Database::begin`], if any.
    active: Option<TransactionId>,
}

/// SQLite-backed [`Database`].
///
/// Vectors are stored as bracketed text. The connection registers a deterministic
/// `vector_score(a, b)` function returning `(1 + cosine) / 2` for two such texts.
/// All SQLite work runs inside `tokio::task::spawn_blocking`.
///
/// # Example
///
/// ```rust,no_run
/// use embedstore_sqlite::SqliteDatabase;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // File-based (persists across restarts)
/// let db = SqliteDatabase::new("/var/lib/myapp/embeddings.db")?;
///
/// // In-memory (for testing)
/// let db = SqliteDatabase::in_memory()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteDatabase {
    inner: Arc<Mutex<Inner>>,
}

impl SqliteDatabase {
    /// Open (or create) a SQLite database file.
    pub fn new(path: impl AsRef<std::path::Path>) -> Result<Self, EmbedStoreError> {
        let conn = Connection::open(path)
            .map_err(|e| EmbedStoreError::Database(format!("SQLite open: {e}")))?;
        register_vector_score(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { conn, active: None })),
        })
    }

    /// Open a private in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, EmbedStoreError> {
        Self::new(":memory:")
    }

    async fn with_inner<T, F>(&self, f: F) -> Result<T, EmbedStoreError>
    where
        F: FnOnce(&mut Inner) -> Result<T, EmbedStoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut inner = inner
                .lock()
                .map_err(|e| EmbedStoreError::Database(format!("Lock: {e}")))?;
            f(&mut inner)
        })
        .await
        .map_err(|e| EmbedStoreError::Database(format!("spawn_blocking: {e}")))?
    }
}

fn register_vector_score(conn: &Connection) -> Result<(), EmbedStoreError> {
    conn.create_scalar_function(
        "vector_score",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: Option<String> = ctx.get(0)?;
            let b: Option<String> = ctx.get(1)?;
            let (Some(a), Some(b)) = (a, b) else {
                return Ok(None);
            };
            let a = parse_vector(&a)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let b = parse_vector(&b)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(Some(relevance_score(&a, &b)))
        },
    )
    .map_err(|e| EmbedStoreError::Database(format!("SQLite register vector_score: {e}")))
}

fn check_transaction(
    inner: &Inner,
    transaction: Option<&TransactionId>,
) -> Result<(), EmbedStoreError> {
    match (transaction, inner.active.as_ref()) {
        (Some(requested), Some(active)) if requested == active => Ok(()),
        (Some(requested), _) => Err(EmbedStoreError::Database(format!(
            "unknown transaction '{requested}'"
        ))),
        // The connection is shared, so running outside the open transaction would
        // read or write its uncommitted rows.
        (None, Some(active)) => Err(EmbedStoreError::Database(format!(
            "connection is inside transaction '{active}'; pass its id"
        ))),
        (None, None) => Ok(()),
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Double(d) => Value::Real(*d),
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Uuid(u) => Value::Text(u.to_string()),
        SqlValue::Vector(v) => Value::Text(format_vector(v)),
    }
}

fn from_sqlite(value: ValueRef<'_>, expected: &ColumnType) -> SqlValue {
    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
    match (value, expected) {
        (ValueRef::Null, _) => SqlValue::Null,

        (ValueRef::Text(t), ColumnType::Identifier) => {
            let t = text(t);
            match Uuid::parse_str(&t) {
                Ok(id) => SqlValue::Uuid(id),
                Err(_) => SqlValue::Text(t),
            }
        }
        (ValueRef::Blob(b), ColumnType::Identifier) => match Uuid::from_slice(b) {
            Ok(id) => SqlValue::Uuid(id),
            Err(_) => SqlValue::Text(text(b)),
        },

        (ValueRef::Integer(i), ColumnType::Number) => SqlValue::Double(i as f64),
        (ValueRef::Text(t), ColumnType::Number) => {
            let t = text(t);
            match t.trim().parse::<f64>() {
                Ok(d) => SqlValue::Double(d),
                Err(_) => SqlValue::Text(t),
            }
        }

        (ValueRef::Real(r), ColumnType::Integer) if r.fract() == 0.0 => {
            SqlValue::Integer(r as i64)
        }
        (ValueRef::Text(t), ColumnType::Integer) => {
            let t = text(t);
            match t.trim().parse::<i64>() {
                Ok(i) => SqlValue::Integer(i),
                Err(_) => SqlValue::Text(t),
            }
        }

        (ValueRef::Integer(i), ColumnType::Text | ColumnType::DateTime) => {
            SqlValue::Text(i.to_string())
        }
        (ValueRef::Real(r), ColumnType::Text | ColumnType::DateTime) => {
            SqlValue::Text(r.to_string())
        }

        (ValueRef::Integer(i), _) => SqlValue::Integer(i),
        (ValueRef::Real(r), _) => SqlValue::Double(r),
        (ValueRef::Text(t), _) | (ValueRef::Blob(t), _) => SqlValue::Text(text(t)),
    }
}

fn run_statements(conn: &Connection, statements: &[Statement]) -> Result<u64, EmbedStoreError> {
    let mut affected = 0u64;
    for statement in statements {
        let mut prepared = conn.prepare_cached(&statement.sql).map_err(|e| {
            EmbedStoreError::Database(format!("SQLite prepare '{}': {e}", statement.sql))
        })?;
        let changed = prepared
            .execute(params_from_iter(statement.params.iter().map(to_sqlite)))
            .map_err(|e| EmbedStoreError::Database(format!("SQLite execute: {e}")))?;
        affected += changed as u64;
    }
    Ok(affected)
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn product(&self) -> Result<DatabaseProduct, EmbedStoreError> {
        Ok(DatabaseProduct::Sqlite)
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>, EmbedStoreError> {
        let table = table.to_string();
        self.with_inner(move |inner| {
            let (schema, name) = match table.split_once('.') {
                Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
                None => (None, table.clone()),
            };
            let sql = if schema.is_some() {
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid"
            } else {
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid"
            };
            let mut stmt = inner
                .conn
                .prepare(sql)
                .map_err(|e| EmbedStoreError::Database(format!("SQLite table_info: {e}")))?;
            let mut params = vec![Value::Text(name)];
            if let Some(schema) = schema {
                params.push(Value::Text(schema));
            }
            let columns = stmt
                .query_map(params_from_iter(params), |row| {
                    Ok(ColumnInfo {
                        name: row.get(0)?,
                        declared_type: row.get(1)?,
                        nullable: row.get::<_, i64>(2)? == 0,
                        primary_key: row.get::<_, i64>(3)? > 0,
                    })
                })
                .map_err(|e| EmbedStoreError::Database(format!("SQLite table_info: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| EmbedStoreError::Database(format!("SQLite table_info row: {e}")))?;

            if columns.is_empty() {
                Ok(None)
            } else {
                Ok(Some(TableInfo {
                    name: table,
                    columns,
                }))
            }
        })
        .await
    }

    async fn execute(
        &self,
        transaction: Option<&TransactionId>,
        statements: Vec<Statement>,
    ) -> Result<u64, EmbedStoreError> {
        let transaction = transaction.cloned();
        self.with_inner(move |inner| {
            check_transaction(inner, transaction.as_ref())?;
            if transaction.is_some() {
                return run_statements(&inner.conn, &statements);
            }
            let tx = inner
                .conn
                .transaction()
                .map_err(|e| EmbedStoreError::Database(format!("SQLite BEGIN: {e}")))?;
            let affected = run_statements(&tx, &statements)?;
            tx.commit()
                .map_err(|e| EmbedStoreError::Database(format!("SQLite COMMIT: {e}")))?;
            Ok(affected)
        })
        .await
    }

    async fn query(
        &self,
        transaction: Option<&TransactionId>,
        statement: Statement,
        columns: &[ColumnType],
    ) -> Result<Vec<Vec<SqlValue>>, EmbedStoreError> {
        let transaction = transaction.cloned();
        let columns = columns.to_vec();
        self.with_inner(move |inner| {
            check_transaction(inner, transaction.as_ref())?;
            let mut prepared = inner.conn.prepare_cached(&statement.sql).map_err(|e| {
                EmbedStoreError::Database(format!("SQLite prepare '{}': {e}", statement.sql))
            })?;
            let mut rows = prepared
                .query(params_from_iter(statement.params.iter().map(to_sqlite)))
                .map_err(|e| EmbedStoreError::Database(format!("SQLite query: {e}")))?;

            let mut out = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| EmbedStoreError::Database(format!("SQLite row: {e}")))?
            {
                let mut values = Vec::with_capacity(columns.len());
                for (i, expected) in columns.iter().enumerate() {
                    let value = row
                        .get_ref(i)
                        .map_err(|e| EmbedStoreError::Database(format!("SQLite column {i}: {e}")))?;
                    values.push(from_sqlite(value, expected));
                }
                out.push(values);
            }
            Ok(out)
        })
        .await
    }

    async fn begin(&self) -> Result<TransactionId, EmbedStoreError> {
        self.with_inner(|inner| {
            if let Some(active) = &inner.active {
                return Err(EmbedStoreError::Database(format!(
                    "transaction '{active}' is already open"
                )));
            }
            inner
                .conn
                .execute_batch("BEGIN")
                .map_err(|e| EmbedStoreError::Database(format!("SQLite BEGIN: {e}")))?;
            let id = TransactionId::new();
            debug!(transaction = %id, "began SQLite transaction");
            inner.active = Some(id.clone());
            Ok(id)
        })
        .await
    }

    async fn commit(&self, transaction: &TransactionId) -> Result<(), EmbedStoreError> {
        let transaction = transaction.clone();
        self.with_inner(move |inner| {
            check_transaction(inner, Some(&transaction))?;
            inner
                .conn
                .execute_batch("COMMIT")
                .map_err(|e| EmbedStoreError::Database(format!("SQLite COMMIT: {e}")))?;
            inner.active = None;
            Ok(())
        })
        .await
    }

    async fn rollback(&self, transaction: &TransactionId) -> Result<(), EmbedStoreError> {
        let transaction = transaction.clone();
        self.with_inner(move |inner| {
            check_transaction(inner, Some(&transaction))?;
            inner
                .conn
                .execute_batch("ROLLBACK")
                .map_err(|e| EmbedStoreError::Database(format!("SQLite ROLLBACK: {e}")))?;
            inner.active = None;
            Ok(())
        })
        .await
    }
}
