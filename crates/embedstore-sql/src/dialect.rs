use std::sync::Arc;

use async_trait::async_trait;
use embedstore_core::{
    ColumnInfo, ColumnType, Database, DatabaseProduct, EmbedStoreError, SqlValue, Statement,
};
use serde_json::Value;

/// A vector handed to [`Dialect::bind_vector_parameter`].
#[derive(Debug, Clone, Copy)]
pub enum VectorParam<'a> {
    Floats(&'a [f32]),
    /// A generic numeric array, e.g. one that arrived as JSON.
    Numbers(&'a [Value]),
}

impl VectorParam<'_> {
    /// Convert to floats, or `None` if any element is not a number.
    pub fn to_floats(&self) -> Option<Vec<f32>> {
        match self {
            VectorParam::Floats(values) => Some(values.to_vec()),
            VectorParam::Numbers(values) => values
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect(),
        }
    }
}

/// Database-specific SQL generation and vector handling.
///
/// One implementation per backend product, chosen once by [`dialect_for`] when a
/// store is opened.
#[async_trait]
pub trait Dialect: Send + Sync {
    fn product(&self) -> DatabaseProduct;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Quote a possibly schema-qualified table name.
    fn quote_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Positional placeholder for the 1-based parameter `n`.
    fn placeholder(&self, n: usize) -> String;

    /// Declared SQL type used when creating a column.
    fn column_type_sql(&self, column_type: &ColumnType) -> String;

    /// Resolve an introspected column to its logical type.
    fn classify_column(&self, column: &ColumnInfo) -> ColumnType;

    /// Parameter expression for binding a value into a column of `column_type`.
    fn param_expr(&self, column_type: &ColumnType, n: usize) -> String {
        let _ = column_type;
        self.placeholder(n)
    }

    /// Expression selecting `column` in a form the driver decodes as `column_type`.
    fn select_expr(&self, column: &str, column_type: &ColumnType) -> String {
        let _ = column_type;
        self.quote_ident(column)
    }

    /// Relevance of `vector_column` to the query vector bound at parameter `n`, in [0, 1].
    fn score_expr(&self, vector_column: &str, n: usize) -> String;

    /// Statements run before `CREATE TABLE`, in the same unit of work.
    fn create_table_prelude(&self) -> Vec<Statement> {
        Vec::new()
    }

    /// Encode a vector as a native parameter. `None` means the backend has no native
    /// vector type and the caller should fall back to the text form.
    fn bind_vector_parameter(&self, value: VectorParam<'_>) -> Option<SqlValue>;

    /// Create an approximate nearest-neighbour index on the vector column.
    ///
    /// Returns `Ok(false)` when the backend has no such index; callers then build a
    /// plain secondary index instead.
    async fn create_vector_index(
        &self,
        db: &dyn Database,
        table: &str,
        index: &str,
        column: &str,
        list_size: u32,
    ) -> Result<bool, EmbedStoreError>;

    /// Parse a vector that was read back as text.
    fn parse_vector(&self, text: &str) -> Result<Vec<f32>, EmbedStoreError> {
        embedstore_core::parse_vector(text)
    }
}

/// Pick the dialect for a detected backend product.
pub fn dialect_for(product: &DatabaseProduct) -> Arc<dyn Dialect> {
    match product {
        DatabaseProduct::PostgreSql => Arc::new(PostgresDialect),
        other => Arc::new(GenericDialect::new(other.clone())),
    }
}

/// Parse the `(n)` suffix of a declared type such as `vector(3)`.
fn declared_width(declared: &str) -> usize {
    declared
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .and_then(|(width, _)| width.trim().parse().ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// PostgreSQL + pgvector
// ---------------------------------------------------------------------------

/// PostgreSQL with the pgvector extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn cast(column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Text => "text".to_string(),
            ColumnType::Number => "double precision".to_string(),
            ColumnType::Integer => "bigint".to_string(),
            ColumnType::Identifier => "uuid".to_string(),
            ColumnType::DateTime => "timestamptz".to_string(),
            ColumnType::Vector { .. } => "vector".to_string(),
            ColumnType::Other { declared } => declared.clone(),
        }
    }
}

#[async_trait]
impl Dialect for PostgresDialect {
    fn product(&self) -> DatabaseProduct {
        DatabaseProduct::PostgreSql
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn column_type_sql(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Vector { dimension } => format!("vector({dimension})"),
            other => Self::cast(other),
        }
    }

    fn classify_column(&self, column: &ColumnInfo) -> ColumnType {
        let declared = column.declared_type.trim().to_ascii_lowercase();
        if declared.starts_with("vector") {
            ColumnType::Vector {
                dimension: declared_width(&declared),
            }
        } else if declared == "uuid" {
            ColumnType::Identifier
        } else if declared == "text"
            || declared.starts_with("character")
            || declared.starts_with("varchar")
        {
            ColumnType::Text
        } else if declared == "double precision"
            || declared == "real"
            || declared.starts_with("numeric")
        {
            ColumnType::Number
        } else if matches!(declared.as_str(), "bigint" | "integer" | "smallint") {
            ColumnType::Integer
        } else if declared.starts_with("timestamp")
            || declared == "date"
            || declared.starts_with("time")
        {
            ColumnType::DateTime
        } else {
            ColumnType::Other {
                declared: column.declared_type.clone(),
            }
        }
    }

    fn param_expr(&self, column_type: &ColumnType, n: usize) -> String {
        format!("${n}::{}", Self::cast(column_type))
    }

    fn select_expr(&self, column: &str, column_type: &ColumnType) -> String {
        let quoted = self.quote_ident(column);
        match column_type {
            ColumnType::Number => format!("{quoted}::double precision"),
            ColumnType::Integer => format!("{quoted}::bigint"),
            ColumnType::DateTime | ColumnType::Other { .. } => format!("{quoted}::text"),
            ColumnType::Text | ColumnType::Identifier | ColumnType::Vector { .. } => quoted,
        }
    }

    fn score_expr(&self, vector_column: &str, n: usize) -> String {
        format!(
            "(2 - ({} <=> ${n}::vector)) / 2",
            self.quote_ident(vector_column)
        )
    }

    fn create_table_prelude(&self) -> Vec<Statement> {
        vec![Statement::new("CREATE EXTENSION IF NOT EXISTS vector")]
    }

    fn bind_vector_parameter(&self, value: VectorParam<'_>) -> Option<SqlValue> {
        value.to_floats().map(SqlValue::Vector)
    }

    async fn create_vector_index(
        &self,
        db: &dyn Database,
        table: &str,
        index: &str,
        column: &str,
        list_size: u32,
    ) -> Result<bool, EmbedStoreError> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING ivfflat ({} vector_cosine_ops) WITH (lists = {list_size})",
            self.quote_ident(index),
            self.quote_table(table),
            self.quote_ident(column),
        );
        db.execute(None, vec![Statement::new(sql)]).await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Generic (SQLite and unknown products)
// ---------------------------------------------------------------------------

/// Portable dialect. Vectors travel as bracketed text and the backend must provide a
/// `vector_score(a, b)` SQL function returning the relevance of two such texts.
#[derive(Debug, Clone)]
pub struct GenericDialect {
    product: DatabaseProduct,
}

impl GenericDialect {
    pub fn new(product: DatabaseProduct) -> Self {
        Self { product }
    }
}

impl Default for GenericDialect {
    fn default() -> Self {
        Self::new(DatabaseProduct::Sqlite)
    }
}

#[async_trait]
impl Dialect for GenericDialect {
    fn product(&self) -> DatabaseProduct {
        self.product.clone()
    }

    fn placeholder(&self, n: usize) -> String {
        format!("?{n}")
    }

    fn column_type_sql(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Number => "DOUBLE".to_string(),
            ColumnType::Integer => "BIGINT".to_string(),
            ColumnType::Identifier => "UUID".to_string(),
            ColumnType::DateTime => "DATETIME".to_string(),
            ColumnType::Vector { dimension } => format!("VECTOR({dimension})"),
            ColumnType::Other { declared } => declared.clone(),
        }
    }

    fn classify_column(&self, column: &ColumnInfo) -> ColumnType {
        let declared = column.declared_type.trim().to_ascii_uppercase();
        let has = |needle: &str| declared.contains(needle);
        if declared.starts_with("VECTOR") {
            ColumnType::Vector {
                dimension: declared_width(&declared),
            }
        } else if declared == "UUID" {
            ColumnType::Identifier
        } else if has("DATE") || has("TIME") {
            ColumnType::DateTime
        } else if has("INT") {
            ColumnType::Integer
        } else if has("CHAR") || has("TEXT") || has("CLOB") {
            ColumnType::Text
        } else if has("REAL")
            || has("FLOA")
            || has("DOUB")
            || has("NUMERIC")
            || has("DECIMAL")
        {
            ColumnType::Number
        } else {
            ColumnType::Other {
                declared: column.declared_type.clone(),
            }
        }
    }

    fn score_expr(&self, vector_column: &str, n: usize) -> String {
        format!("vector_score({}, ?{n})", self.quote_ident(vector_column))
    }

    fn bind_vector_parameter(&self, _value: VectorParam<'_>) -> Option<SqlValue> {
        None
    }

    async fn create_vector_index(
        &self,
        _db: &dyn Database,
        _table: &str,
        _index: &str,
        _column: &str,
        _list_size: u32,
    ) -> Result<bool, EmbedStoreError> {
        Ok(false)
    }
}
