use std::collections::{BTreeMap, HashSet};

use embedstore_core::{
    ColumnType, Database, EmbedStoreError, MetaDataKey, Statement, TableInfo,
};
use tracing::{debug, info, warn};

use crate::dialect::Dialect;

/// Primary-key column holding the UUID of each row.
pub const EMBEDDING_ID_COLUMN: &str = "embedding_id";
/// Vector column.
pub const EMBEDDING_COLUMN: &str = "embedding";
/// Optional text column.
pub const TEXT_COLUMN: &str = "text";
/// Alias of the computed relevance score in search queries.
pub const SCORE_ALIAS: &str = "embedstore_score";
/// Default `lists` parameter of the approximate nearest-neighbour index.
pub const DEFAULT_EMBEDDING_LIST_SIZE: u32 = 500;

const RESERVED_COLUMNS: [&str; 3] = [EMBEDDING_ID_COLUMN, EMBEDDING_COLUMN, TEXT_COLUMN];

/// Arguments for [`SchemaManager::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub table_name: String,
    pub metadata_keys: Vec<MetaDataKey>,
    /// Vector width. Required when the table may be created.
    pub dimension: usize,
    pub create_if_missing: bool,
    /// Drop an existing table before opening. Requires `create_if_missing`.
    pub drop_first: bool,
    pub store_text: bool,
    pub embedding_list_size: u32,
}

impl OpenOptions {
    pub fn new(table_name: impl Into<String>, dimension: usize) -> Self {
        Self {
            table_name: table_name.into(),
            metadata_keys: Vec::new(),
            dimension,
            create_if_missing: true,
            drop_first: false,
            store_text: true,
            embedding_list_size: DEFAULT_EMBEDDING_LIST_SIZE,
        }
    }

    pub fn metadata_key(mut self, key: MetaDataKey) -> Self {
        self.metadata_keys.push(key);
        self
    }

    pub fn metadata_keys(mut self, keys: impl IntoIterator<Item = MetaDataKey>) -> Self {
        self.metadata_keys.extend(keys);
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn drop_first(mut self, drop_first: bool) -> Self {
        self.drop_first = drop_first;
        self
    }

    pub fn store_text(mut self, store_text: bool) -> Self {
        self.store_text = store_text;
        self
    }

    pub fn embedding_list_size(mut self, list_size: u32) -> Self {
        self.embedding_list_size = list_size;
        self
    }
}

/// Resolved, immutable description of an opened embeddings table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    table_name: String,
    column_types: BTreeMap<String, ColumnType>,
    metadata_keys: Vec<MetaDataKey>,
    dimension: usize,
    was_just_created: bool,
}

impl TableSchema {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Physical type of every column the store reads or writes.
    pub fn column_types(&self) -> &BTreeMap<String, ColumnType> {
        &self.column_types
    }

    pub fn column_type(&self, column: &str) -> Option<&ColumnType> {
        self.column_types.get(column)
    }

    pub fn metadata_keys(&self) -> &[MetaDataKey] {
        &self.metadata_keys
    }

    /// Vector width, or 0 when neither the caller nor the table declared one.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn has_text(&self) -> bool {
        self.column_types.contains_key(TEXT_COLUMN)
    }

    /// Whether the table was created by the `open` call that produced this schema.
    pub fn was_just_created(&self) -> bool {
        self.was_just_created
    }
}

/// Options recovered from an existing table by [`SchemaManager::derive`].
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedOptions {
    pub metadata_keys: Vec<MetaDataKey>,
    pub store_text: bool,
    pub dimension: usize,
}

/// Opens, creates and validates embeddings tables.
pub struct SchemaManager;

impl SchemaManager {
    /// Resolve the table named in `options`, creating it when allowed, and validate
    /// its structure.
    pub async fn open(
        db: &dyn Database,
        dialect: &dyn Dialect,
        options: &OpenOptions,
    ) -> Result<TableSchema, EmbedStoreError> {
        validate_table_name(&options.table_name)?;
        validate_metadata_keys(&options.metadata_keys)?;
        if options.create_if_missing && options.dimension == 0 {
            return Err(EmbedStoreError::Configuration(
                "dimension must be > 0 when the table may be created".to_string(),
            ));
        }
        if options.drop_first && !options.create_if_missing {
            return Err(EmbedStoreError::Configuration(
                "drop_first requires create_if_missing".to_string(),
            ));
        }

        let table = options.table_name.as_str();
        let mut existing = db.describe_table(table).await?;

        if options.drop_first && existing.is_some() {
            let sql = format!("DROP TABLE {}", dialect.quote_table(table));
            db.execute(None, vec![Statement::new(sql)]).await?;
            info!(table, "dropped embeddings table");
            existing = None;
        }

        let mut was_just_created = false;
        let info = match existing {
            Some(info) => info,
            None if !options.create_if_missing => {
                return Err(EmbedStoreError::Schema(format!("missing table '{table}'")));
            }
            None => {
                Self::create(db, dialect, options).await?;
                was_just_created = true;
                db.describe_table(table).await?.ok_or_else(|| {
                    EmbedStoreError::Schema(format!("table '{table}' not found after creation"))
                })?
            }
        };

        Self::validate(dialect, options, info, was_just_created)
    }

    /// Recover metadata keys, text flag and vector width from an existing table.
    /// Returns `None` when the table does not exist.
    pub async fn derive(
        db: &dyn Database,
        dialect: &dyn Dialect,
        table: &str,
    ) -> Result<Option<DerivedOptions>, EmbedStoreError> {
        validate_table_name(table)?;
        let Some(info) = db.describe_table(table).await? else {
            return Ok(None);
        };

        let mut metadata_keys = Vec::new();
        let mut store_text = false;
        let mut dimension = 0;
        for column in &info.columns {
            let column_type = dialect.classify_column(column);
            if column.name.eq_ignore_ascii_case(EMBEDDING_ID_COLUMN) {
                continue;
            }
            if column.name.eq_ignore_ascii_case(EMBEDDING_COLUMN) {
                if let ColumnType::Vector { dimension: width } = column_type {
                    dimension = width;
                }
                continue;
            }
            if column.name.eq_ignore_ascii_case(TEXT_COLUMN) {
                store_text = column_type == ColumnType::Text;
                continue;
            }
            match column_type.kind() {
                Some(kind) => metadata_keys.push(
                    MetaDataKey::new(column.name.clone(), kind).allow_null(column.nullable),
                ),
                None => warn!(
                    table,
                    column = %column.name,
                    declared = %column.declared_type,
                    "skipping column with unsupported type while deriving metadata keys"
                ),
            }
        }

        Ok(Some(DerivedOptions {
            metadata_keys,
            store_text,
            dimension,
        }))
    }

    /// Metadata keys for the primary key columns of `table`, in column order.
    ///
    /// Keys are non-null and carry no flags. Returns `None` when the table does not
    /// exist.
    pub async fn primary_key_metadata(
        db: &dyn Database,
        dialect: &dyn Dialect,
        table: &str,
    ) -> Result<Option<Vec<MetaDataKey>>, EmbedStoreError> {
        validate_table_name(table)?;
        let Some(info) = db.describe_table(table).await? else {
            return Ok(None);
        };

        let mut keys = Vec::new();
        for column in info.columns.iter().filter(|c| c.primary_key) {
            let kind = dialect.classify_column(column).kind().ok_or_else(|| {
                EmbedStoreError::Configuration(format!(
                    "primary key column '{}' of '{table}' has unsupported type '{}'",
                    column.name, column.declared_type
                ))
            })?;
            keys.push(MetaDataKey::new(column.name.clone(), kind));
        }
        if keys.is_empty() {
            return Err(EmbedStoreError::Configuration(format!(
                "table '{table}' has no primary key"
            )));
        }
        Ok(Some(keys))
    }

    async fn create(
        db: &dyn Database,
        dialect: &dyn Dialect,
        options: &OpenOptions,
    ) -> Result<(), EmbedStoreError> {
        let table = options.table_name.as_str();
        let quoted_table = dialect.quote_table(table);

        let mut columns = vec![format!(
            "{} {} NOT NULL PRIMARY KEY",
            dialect.quote_ident(EMBEDDING_ID_COLUMN),
            dialect.column_type_sql(&ColumnType::Identifier)
        )];
        for key in &options.metadata_keys {
            let null = if key.allow_null { "" } else { " NOT NULL" };
            columns.push(format!(
                "{} {}{null}",
                dialect.quote_ident(&key.name),
                dialect.column_type_sql(&ColumnType::from(key.kind))
            ));
        }
        columns.push(format!(
            "{} {} NOT NULL",
            dialect.quote_ident(EMBEDDING_COLUMN),
            dialect.column_type_sql(&ColumnType::Vector {
                dimension: options.dimension
            })
        ));
        if options.store_text {
            columns.push(format!(
                "{} {}",
                dialect.quote_ident(TEXT_COLUMN),
                dialect.column_type_sql(&ColumnType::Text)
            ));
        }

        let mut statements = dialect.create_table_prelude();
        statements.push(Statement::new(format!(
            "CREATE TABLE {quoted_table} ({})",
            columns.join(", ")
        )));
        db.execute(None, statements).await?;
        info!(
            table,
            dimension = options.dimension,
            metadata_keys = options.metadata_keys.len(),
            store_text = options.store_text,
            "created embeddings table"
        );

        let suffix = table.replace('.', "_");

        if !options.metadata_keys.is_empty() {
            let index = format!("_es_meta_{suffix}");
            let key_columns: Vec<String> = options
                .metadata_keys
                .iter()
                .map(|k| dialect.quote_ident(&k.name))
                .collect();
            if let Err(e) = create_plain_index(db, dialect, table, &index, &key_columns).await {
                warn!(table, index = %index, error = %e, "failed to create metadata index");
            }
        }

        let index = format!("_es_embedding_{suffix}");
        let native = match dialect
            .create_vector_index(
                db,
                table,
                &index,
                EMBEDDING_COLUMN,
                options.embedding_list_size,
            )
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(table, index = %index, error = %e, "failed to create vector index, falling back to a plain index");
                false
            }
        };
        if !native {
            let column = [dialect.quote_ident(EMBEDDING_COLUMN)];
            match create_plain_index(db, dialect, table, &index, &column).await {
                Ok(()) => debug!(table, index = %index, "created plain index on vector column"),
                Err(e) => warn!(table, index = %index, error = %e, "failed to create vector column index"),
            }
        }

        Ok(())
    }

    fn validate(
        dialect: &dyn Dialect,
        options: &OpenOptions,
        info: TableInfo,
        was_just_created: bool,
    ) -> Result<TableSchema, EmbedStoreError> {
        let table = options.table_name.as_str();
        let mut column_types = BTreeMap::new();

        let id = info.column(EMBEDDING_ID_COLUMN).ok_or_else(|| {
            EmbedStoreError::Schema(format!(
                "missing primary key column '{EMBEDDING_ID_COLUMN}' in table '{table}'"
            ))
        })?;
        if !id.primary_key {
            return Err(EmbedStoreError::Schema(format!(
                "column '{EMBEDDING_ID_COLUMN}' of table '{table}' is not the primary key"
            )));
        }
        let id_type = dialect.classify_column(id);
        if id_type != ColumnType::Identifier {
            return Err(EmbedStoreError::Schema(format!(
                "column '{EMBEDDING_ID_COLUMN}' of table '{table}' is not a UUID column ({})",
                id.declared_type
            )));
        }
        column_types.insert(EMBEDDING_ID_COLUMN.to_string(), id_type);

        for key in &options.metadata_keys {
            let column = info.column(&key.name).ok_or_else(|| {
                EmbedStoreError::Schema(format!(
                    "missing metadata column '{}' in table '{table}'",
                    key.name
                ))
            })?;
            column_types.insert(key.name.clone(), dialect.classify_column(column));
        }

        let vector = info.column(EMBEDDING_COLUMN).ok_or_else(|| {
            EmbedStoreError::Schema(format!(
                "missing vector column '{EMBEDDING_COLUMN}' in table '{table}'"
            ))
        })?;
        let vector_type = dialect.classify_column(vector);
        let ColumnType::Vector { dimension: width } = vector_type else {
            return Err(EmbedStoreError::Schema(format!(
                "column '{EMBEDDING_COLUMN}' of table '{table}' is not a vector column ({})",
                vector.declared_type
            )));
        };
        if options.dimension > 0 && width > 0 && width != options.dimension {
            return Err(EmbedStoreError::Schema(format!(
                "vector column '{EMBEDDING_COLUMN}' of table '{table}' has dimension {width}, expected {}",
                options.dimension
            )));
        }
        let dimension = if options.dimension > 0 {
            options.dimension
        } else {
            width
        };
        column_types.insert(EMBEDDING_COLUMN.to_string(), vector_type);

        match info.column(TEXT_COLUMN) {
            Some(text) => {
                let text_type = dialect.classify_column(text);
                if text_type == ColumnType::Text {
                    column_types.insert(TEXT_COLUMN.to_string(), text_type);
                } else if options.store_text {
                    return Err(EmbedStoreError::Schema(format!(
                        "column '{TEXT_COLUMN}' of table '{table}' is not a text column ({})",
                        text.declared_type
                    )));
                }
            }
            None if options.store_text => {
                return Err(EmbedStoreError::Schema(format!(
                    "missing text column '{TEXT_COLUMN}' in table '{table}'"
                )));
            }
            None => {}
        }

        debug!(table, columns = column_types.len(), was_just_created, "validated embeddings table");

        Ok(TableSchema {
            table_name: options.table_name.clone(),
            column_types,
            metadata_keys: options.metadata_keys.clone(),
            dimension,
            was_just_created,
        })
    }
}

async fn create_plain_index(
    db: &dyn Database,
    dialect: &dyn Dialect,
    table: &str,
    index: &str,
    quoted_columns: &[String],
) -> Result<(), EmbedStoreError> {
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        dialect.quote_ident(index),
        dialect.quote_table(table),
        quoted_columns.join(", ")
    );
    db.execute(None, vec![Statement::new(sql)]).await.map(|_| ())
}

/// Table names allow ASCII alphanumerics, `_` and `.` between non-empty parts.
pub fn validate_table_name(name: &str) -> Result<(), EmbedStoreError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(EmbedStoreError::Configuration(format!(
            "invalid table name '{name}': only alphanumeric characters, underscores, and dots are allowed"
        )))
    }
}

fn validate_metadata_keys(keys: &[MetaDataKey]) -> Result<(), EmbedStoreError> {
    let mut seen = HashSet::new();
    for key in keys {
        let name = key.name.as_str();
        let well_formed = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !well_formed {
            return Err(EmbedStoreError::Configuration(format!(
                "invalid metadata key name '{name}'"
            )));
        }
        if RESERVED_COLUMNS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
        {
            return Err(EmbedStoreError::Configuration(format!(
                "metadata key '{name}' collides with a fixed column"
            )));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(EmbedStoreError::Configuration(format!(
                "duplicate metadata key '{name}'"
            )));
        }
    }
    Ok(())
}
