use std::collections::HashMap;

use async_trait::async_trait;
use embedstore_core::{
    ColumnInfo, ColumnType, Database, DatabaseProduct, EmbedStoreError, SqlValue, Statement,
    TableInfo, TransactionId,
};
use pgvector::Vector;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const DESCRIBE_SQL: &str = r#"
    SELECT a.attname::text,
           format_type(a.atttypid, a.atttypmod),
           NOT a.attnotnull,
           EXISTS (
               SELECT 1 FROM pg_index i
               WHERE i.indrelid = a.attrelid
                 AND i.indisprimary
                 AND a.attnum = ANY(i.indkey)
           )
    FROM pg_attribute a
    WHERE a.attrelid = to_regclass($1::text)
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum"#;

/// [`Database`] backed by a PostgreSQL pool with the pgvector extension.
///
/// Vectors are bound and decoded natively as `pgvector::Vector`. Transactions opened
/// with [`begin`](Database::begin) are kept by id until committed or rolled back.
pub struct PgDatabase {
    pool: PgPool,
    transactions: Mutex<HashMap<TransactionId, Transaction<'static, Postgres>>>,
}

impl PgDatabase {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Connect a small pool to `url`.
    pub async fn connect(url: &str) -> Result<Self, EmbedStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| EmbedStoreError::Database(format!("Postgres connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Return a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Double(d) => query.bind(*d),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Uuid(u) => query.bind(*u),
            SqlValue::Vector(v) => query.bind(Vector::from(v.clone())),
        };
    }
    query
}

fn decode_row(row: &PgRow, columns: &[ColumnType]) -> Result<Vec<SqlValue>, sqlx::Error> {
    columns
        .iter()
        .enumerate()
        .map(|(i, expected)| {
            let value = match expected {
                ColumnType::Number => row.try_get::<Option<f64>, _>(i)?.map(SqlValue::Double),
                ColumnType::Integer => row.try_get::<Option<i64>, _>(i)?.map(SqlValue::Integer),
                ColumnType::Identifier => row.try_get::<Option<Uuid>, _>(i)?.map(SqlValue::Uuid),
                ColumnType::Vector { .. } => row
                    .try_get::<Option<Vector>, _>(i)?
                    .map(|v| SqlValue::Vector(v.to_vec())),
                ColumnType::Text | ColumnType::DateTime | ColumnType::Other { .. } => {
                    row.try_get::<Option<String>, _>(i)?.map(SqlValue::Text)
                }
            };
            Ok(value.unwrap_or(SqlValue::Null))
        })
        .collect()
}

/// Quote each dot-separated part so `to_regclass` keeps the exact case.
fn regclass_name(table: &str) -> String {
    table
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Product name from the output of `SELECT version()`.
fn product_from_version(version: &str) -> DatabaseProduct {
    DatabaseProduct::from_product_name(version.split_whitespace().next().unwrap_or_default())
}

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> EmbedStoreError {
    move |e| EmbedStoreError::Database(format!("Postgres {context}: {e}"))
}

#[async_trait]
impl Database for PgDatabase {
    async fn product(&self) -> Result<DatabaseProduct, EmbedStoreError> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("version"))?;
        Ok(product_from_version(&version))
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>, EmbedStoreError> {
        let rows: Vec<(String, String, bool, bool)> = sqlx::query_as(DESCRIBE_SQL)
            .bind(regclass_name(table))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("describe table"))?;

        if rows.is_empty() {
            return Ok(None);
        }
        let columns = rows
            .into_iter()
            .map(|(name, declared_type, nullable, primary_key)| ColumnInfo {
                name,
                declared_type,
                nullable,
                primary_key,
            })
            .collect();
        Ok(Some(TableInfo {
            name: table.to_string(),
            columns,
        }))
    }

    async fn execute(
        &self,
        transaction: Option<&TransactionId>,
        statements: Vec<Statement>,
    ) -> Result<u64, EmbedStoreError> {
        let mut affected = 0;
        match transaction {
            Some(id) => {
                let mut transactions = self.transactions.lock().await;
                let tx = transactions.get_mut(id).ok_or_else(|| {
                    EmbedStoreError::Database(format!("unknown transaction '{id}'"))
                })?;
                for statement in &statements {
                    affected += bind_params(sqlx::query(&statement.sql), &statement.params)
                        .execute(&mut **tx)
                        .await
                        .map_err(db_err("execute"))?
                        .rows_affected();
                }
            }
            None => {
                let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
                for statement in &statements {
                    affected += bind_params(sqlx::query(&statement.sql), &statement.params)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err("execute"))?
                        .rows_affected();
                }
                tx.commit().await.map_err(db_err("commit"))?;
            }
        }
        Ok(affected)
    }

    async fn query(
        &self,
        transaction: Option<&TransactionId>,
        statement: Statement,
        columns: &[ColumnType],
    ) -> Result<Vec<Vec<SqlValue>>, EmbedStoreError> {
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);
        let rows = match transaction {
            Some(id) => {
                let mut transactions = self.transactions.lock().await;
                let tx = transactions.get_mut(id).ok_or_else(|| {
                    EmbedStoreError::Database(format!("unknown transaction '{id}'"))
                })?;
                let rows = query.fetch_all(&mut **tx).await;
                rows
            }
            None => query.fetch_all(&self.pool).await,
        }
        .map_err(db_err("query"))?;

        rows.iter()
            .map(|row| decode_row(row, columns))
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("decode"))
    }

    async fn begin(&self) -> Result<TransactionId, EmbedStoreError> {
        let tx = self.pool.begin().await.map_err(db_err("begin"))?;
        let id = TransactionId::new();
        debug!(transaction = %id, "began Postgres transaction");
        self.transactions.lock().await.insert(id.clone(), tx);
        Ok(id)
    }

    async fn commit(&self, transaction: &TransactionId) -> Result<(), EmbedStoreError> {
        let tx = self
            .transactions
            .lock()
            .await
            .remove(transaction)
            .ok_or_else(|| {
                EmbedStoreError::Database(format!("unknown transaction '{transaction}'"))
            })?;
        tx.commit().await.map_err(db_err("commit"))
    }

    async fn rollback(&self, transaction: &TransactionId) -> Result<(), EmbedStoreError> {
        let tx = self
            .transactions
            .lock()
            .await
            .remove(transaction)
            .ok_or_else(|| {
                EmbedStoreError::Database(format!("unknown transaction '{transaction}'"))
            })?;
        tx.rollback().await.map_err(db_err("rollback"))
    }
}
