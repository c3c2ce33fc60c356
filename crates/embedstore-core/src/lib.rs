use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for embedstore with one variant per failure class.
#[derive(Debug, Error)]
pub enum EmbedStoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("loader error: {0}")]
    Loader(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl EmbedStoreError {
    /// Re-label a raw storage failure as a write-path failure.
    pub fn into_write(self) -> Self {
        match self {
            EmbedStoreError::Database(msg) => EmbedStoreError::Write(msg),
            other => other,
        }
    }

    /// Re-label a raw storage failure as a search-path failure.
    pub fn into_search(self) -> Self {
        match self {
            EmbedStoreError::Database(msg) => EmbedStoreError::Search(msg),
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata key model
// ---------------------------------------------------------------------------

/// Metadata attached to a segment or returned with a match.
pub type Metadata = HashMap<String, Value>;

/// Value type of a declared metadata column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    /// 64-bit floating point.
    Number,
    /// 64-bit signed integer.
    Integer,
    /// UUID.
    Identifier,
    DateTime,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Number => "number",
            ColumnKind::Integer => "integer",
            ColumnKind::Identifier => "identifier",
            ColumnKind::DateTime => "datetime",
        }
    }
}

/// Resolved type of a physical column in an embeddings table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Number,
    Integer,
    Identifier,
    DateTime,
    /// A vector column. `dimension` is 0 when the backend records no width.
    Vector { dimension: usize },
    /// Anything the dialect could not classify, with its declared type text.
    Other { declared: String },
}

impl ColumnType {
    /// The metadata kind this column can hold, if any.
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            ColumnType::Text => Some(ColumnKind::Text),
            ColumnType::Number => Some(ColumnKind::Number),
            ColumnType::Integer => Some(ColumnKind::Integer),
            ColumnType::Identifier => Some(ColumnKind::Identifier),
            ColumnType::DateTime => Some(ColumnKind::DateTime),
            ColumnType::Vector { .. } | ColumnType::Other { .. } => None,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, ColumnType::Vector { .. })
    }
}

impl From<ColumnKind> for ColumnType {
    fn from(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Text => ColumnType::Text,
            ColumnKind::Number => ColumnType::Number,
            ColumnKind::Integer => ColumnType::Integer,
            ColumnKind::Identifier => ColumnType::Identifier,
            ColumnKind::DateTime => ColumnType::DateTime,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Vector { dimension } => write!(f, "vector({dimension})"),
            ColumnType::Other { declared } => write!(f, "{declared}"),
            other => match other.kind() {
                Some(kind) => f.write_str(kind.as_str()),
                None => Ok(()),
            },
        }
    }
}

/// Bitset of column flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnFlags(u32);

impl ColumnFlags {
    pub const NONE: ColumnFlags = ColumnFlags(0);
    /// The column scopes rows to a tenant.
    pub const TENANT: ColumnFlags = ColumnFlags(1);
    /// The value is generated by the store, never by the caller.
    pub const SYSTEM_GENERATED: ColumnFlags = ColumnFlags(1 << 1);
    /// The column does not take part in the natural key used for upserts.
    pub const NATURAL_KEY_EXCLUDED: ColumnFlags = ColumnFlags(1 << 2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        ColumnFlags(bits)
    }

    pub const fn contains(self, other: ColumnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ColumnFlags {
    type Output = ColumnFlags;

    fn bitor(self, rhs: ColumnFlags) -> ColumnFlags {
        ColumnFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ColumnFlags {
    fn bitor_assign(&mut self, rhs: ColumnFlags) {
        self.0 |= rhs.0;
    }
}

/// A typed metadata column stored next to every embedding row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataKey {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub allow_null: bool,
    #[serde(default)]
    pub flags: ColumnFlags,
}

impl MetaDataKey {
    /// A non-null key of the given kind without flags.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            allow_null: false,
            flags: ColumnFlags::NONE,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn allow_null(mut self, allow_null: bool) -> Self {
        self.allow_null = allow_null;
        self
    }

    pub fn with_flag(mut self, flag: ColumnFlags) -> Self {
        self.flags |= flag;
        self
    }

    /// Whether this key is part of the natural key used for upserts.
    pub fn is_natural_key(&self) -> bool {
        !self.flags.contains(ColumnFlags::NATURAL_KEY_EXCLUDED)
    }
}

// ---------------------------------------------------------------------------
// Segments and documents
// ---------------------------------------------------------------------------

/// A piece of text plus the metadata stored with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl TextSegment {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }
}

/// A loaded source document, before it is split into segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(
        id: impl Into<String>,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// Search request / match
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_RESULTS: usize = 10;

/// Predicate over a match's metadata, evaluated after the database query.
#[derive(Clone)]
pub struct MetadataFilter(Arc<dyn Fn(&Metadata) -> bool + Send + Sync>);

impl MetadataFilter {
    pub fn new(predicate: impl Fn(&Metadata) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Matches when `key` is present and equal to `value`. Numbers compare by value,
    /// so `1` equals `1.0`.
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let expected = value.into();
        Self::new(move |metadata| match (metadata.get(&key), &expected) {
            (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (Some(actual), expected) => actual == expected,
            (None, _) => false,
        })
    }

    pub fn and(self, other: MetadataFilter) -> Self {
        Self::new(move |metadata| self.matches(metadata) && other.matches(metadata))
    }

    pub fn or(self, other: MetadataFilter) -> Self {
        Self::new(move |metadata| self.matches(metadata) || other.matches(metadata))
    }

    pub fn negate(self) -> Self {
        Self::new(move |metadata| !self.matches(metadata))
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        (self.0)(metadata)
    }
}

impl fmt::Debug for MetadataFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MetadataFilter(..)")
    }
}

/// A nearest-neighbour query against an embeddings table.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_vector: Vec<f32>,
    /// Rows scoring below this are dropped by the database.
    pub min_score: f64,
    pub max_results: usize,
    pub filter: Option<MetadataFilter>,
}

impl SearchRequest {
    pub fn new(query_vector: Vec<f32>) -> Self {
        Self {
            query_vector,
            min_score: 0.0,
            max_results: DEFAULT_MAX_RESULTS,
            filter: None,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One row returned by a similarity search. Higher scores are more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub id: String,
    pub score: f64,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Embeddings trait
// ---------------------------------------------------------------------------

/// Trait for embedding text into vectors. Implementations may be remote and slow.
#[async_trait]
pub trait Embeddings: Send + Sync {
    /// Embed multiple texts (for batch document embedding).
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedStoreError>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedStoreError>;
}

// ---------------------------------------------------------------------------
// Loader trait
// ---------------------------------------------------------------------------

/// Trait for loading documents from a source (files, PDFs, in-memory text).
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self) -> Result<Vec<Document>, EmbedStoreError>;
}

// ---------------------------------------------------------------------------
// Relational access layer
// ---------------------------------------------------------------------------

/// Backend product, detected once when a store is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseProduct {
    PostgreSql,
    Sqlite,
    Other(String),
}

impl DatabaseProduct {
    pub fn from_product_name(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case("postgresql") {
            DatabaseProduct::PostgreSql
        } else if name.eq_ignore_ascii_case("sqlite") {
            DatabaseProduct::Sqlite
        } else {
            DatabaseProduct::Other(name.to_string())
        }
    }
}

/// A statement parameter or a decoded result value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Double(f64),
    Integer(i64),
    Uuid(Uuid),
    /// Native vector value; only produced for backends with a vector type.
    Vector(Vec<f32>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Convert to the JSON value used in metadata maps.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SqlValue::Integer(i) => Value::Number((*i).into()),
            SqlValue::Uuid(u) => Value::String(u.to_string()),
            SqlValue::Vector(v) => Value::Array(
                v.iter()
                    .map(|x| {
                        serde_json::Number::from_f64(f64::from(*x))
                            .map(Value::Number)
                            .unwrap_or(Value::Null)
                    })
                    .collect(),
            ),
        }
    }
}

/// A SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn bind(mut self, value: SqlValue) -> Self {
        self.params.push(value);
        self
    }
}

/// A column as reported by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type text, e.g. `vector(3)` or `UUID`.
    pub declared_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// A table as reported by schema introspection; columns in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// Look up a column by name (ASCII case-insensitive).
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Identifier of an open database transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relational access consumed by the engine. One implementation per driver.
///
/// Statements passed to [`execute`](Database::execute) run atomically: without a
/// transaction id the driver wraps them in its own transaction and commits; with an
/// id they join that open transaction and the caller decides when to commit.
#[async_trait]
pub trait Database: Send + Sync {
    /// Detect the backend product.
    async fn product(&self) -> Result<DatabaseProduct, EmbedStoreError>;

    /// Describe a table, or `None` when it does not exist.
    async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>, EmbedStoreError>;

    /// Run statements as one unit of work. Returns the total number of affected rows.
    async fn execute(
        &self,
        transaction: Option<&TransactionId>,
        statements: Vec<Statement>,
    ) -> Result<u64, EmbedStoreError>;

    /// Run a query and decode each result column as the matching entry of `columns`.
    async fn query(
        &self,
        transaction: Option<&TransactionId>,
        statement: Statement,
        columns: &[ColumnType],
    ) -> Result<Vec<Vec<SqlValue>>, EmbedStoreError>;

    async fn begin(&self) -> Result<TransactionId, EmbedStoreError>;

    async fn commit(&self, transaction: &TransactionId) -> Result<(), EmbedStoreError>;

    async fn rollback(&self, transaction: &TransactionId) -> Result<(), EmbedStoreError>;
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

/// Parse a bracketed, comma-separated list of floats such as `[0.1, 0.2]`.
///
/// An empty list (`[]`) parses to an empty vector.
pub fn parse_vector(text: &str) -> Result<Vec<f32>, EmbedStoreError> {
    let mut body = text.trim();
    if let Some(inner) = body.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        body = inner.trim();
    }
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f32>().map_err(|e| {
                EmbedStoreError::Validation(format!("invalid vector element '{part}': {e}"))
            })
        })
        .collect()
}

/// Render a vector in the bracketed text form accepted by [`parse_vector`].
pub fn format_vector(vector: &[f32]) -> String {
    let parts: Vec<String> = vector.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Cosine similarity in `[-1, 1]`; 0 for empty, mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let mag_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Cosine similarity mapped onto `[0, 1]`: 1 for the same direction, 0 for opposite.
pub fn relevance_score(a: &[f32], b: &[f32]) -> f64 {
    ((1.0 + cosine_similarity(a, b)) / 2.0).clamp(0.0, 1.0)
}
