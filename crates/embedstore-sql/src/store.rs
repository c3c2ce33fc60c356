use std::sync::Arc;

use embedstore_core::{
    Database, EmbedStoreError, SearchMatch, SearchRequest, TextSegment, TransactionId,
};
use tracing::debug;
use uuid::Uuid;

use crate::dialect::{dialect_for, Dialect};
use crate::schema::{OpenOptions, SchemaManager, TableSchema};
use crate::{search, writer};

/// Handle to one embeddings table: schema, dialect and an optional transaction.
///
/// Cloning is cheap. [`with_transaction`](TableStore::with_transaction) returns a new
/// handle sharing the same schema and dialect.
#[derive(Clone)]
pub struct TableStore {
    db: Arc<dyn Database>,
    dialect: Arc<dyn Dialect>,
    schema: Arc<TableSchema>,
    transaction: Option<TransactionId>,
}

impl TableStore {
    /// Detect the backend, pick its dialect and open the table.
    pub async fn open(
        db: Arc<dyn Database>,
        options: &OpenOptions,
    ) -> Result<Self, EmbedStoreError> {
        let product = db.product().await?;
        let dialect = dialect_for(&product);
        Self::open_with_dialect(db, dialect, options).await
    }

    /// Open the table with a dialect the caller already picked.
    pub async fn open_with_dialect(
        db: Arc<dyn Database>,
        dialect: Arc<dyn Dialect>,
        options: &OpenOptions,
    ) -> Result<Self, EmbedStoreError> {
        let schema = SchemaManager::open(db.as_ref(), dialect.as_ref(), options).await?;
        debug!(table = %options.table_name, product = ?dialect.product(), "opened table store");
        Ok(Self {
            db,
            dialect,
            schema: Arc::new(schema),
            transaction: None,
        })
    }

    /// A handle bound to `transaction` (or to none) that shares this handle's schema.
    pub fn with_transaction(&self, transaction: Option<TransactionId>) -> Self {
        Self {
            db: Arc::clone(&self.db),
            dialect: Arc::clone(&self.dialect),
            schema: Arc::clone(&self.schema),
            transaction,
        }
    }

    pub fn transaction(&self) -> Option<&TransactionId> {
        self.transaction.as_ref()
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Upsert rows. `segments`, when given, must be as long as `ids`.
    pub async fn add_all(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        segments: Option<&[TextSegment]>,
    ) -> Result<(), EmbedStoreError> {
        let statements =
            writer::plan_upsert(&self.schema, self.dialect.as_ref(), ids, vectors, segments)?;
        if statements.is_empty() {
            return Ok(());
        }
        let count = statements.len();
        self.db
            .execute(self.transaction.as_ref(), statements)
            .await
            .map_err(EmbedStoreError::into_write)?;
        debug!(
            table = self.schema.table_name(),
            rows = ids.len(),
            statements = count,
            "wrote embedding batch"
        );
        Ok(())
    }

    /// Store one vector under a fresh id and return the id.
    pub async fn add(
        &self,
        vector: Vec<f32>,
        segment: Option<TextSegment>,
    ) -> Result<String, EmbedStoreError> {
        let id = Uuid::new_v4().to_string();
        let segments = segment.map(|s| vec![s]);
        self.add_all(
            std::slice::from_ref(&id),
            std::slice::from_ref(&vector),
            segments.as_deref(),
        )
        .await?;
        Ok(id)
    }

    /// Store vectors under fresh ids, one per row, and return the ids.
    pub async fn add_all_generated(
        &self,
        vectors: &[Vec<f32>],
        segments: Option<&[TextSegment]>,
    ) -> Result<Vec<String>, EmbedStoreError> {
        let ids: Vec<String> = vectors
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        self.add_all(&ids, vectors, segments).await?;
        Ok(ids)
    }

    /// Nearest neighbours of `request.query_vector`, best first.
    pub async fn search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchMatch>, EmbedStoreError> {
        let prepared = search::build_query(&self.schema, self.dialect.as_ref(), request)?;
        let rows = self
            .db
            .query(
                self.transaction.as_ref(),
                prepared.statement,
                &prepared.columns,
            )
            .await
            .map_err(EmbedStoreError::into_search)?;
        let fetched = rows.len();
        let matches = search::map_rows(&self.schema, self.dialect.as_ref(), request, rows)?;
        debug!(
            table = self.schema.table_name(),
            fetched,
            returned = matches.len(),
            "searched embeddings"
        );
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use embedstore_core::{
        ColumnFlags, ColumnInfo, ColumnType, DatabaseProduct, MetaDataKey, MetadataFilter,
        SqlValue, Statement, TableInfo,
    };
    use serde_json::json;

    use super::*;

    /// Records statements; `CREATE TABLE` installs `created` as the described table.
    /// Statements containing `failing` are recorded and then rejected.
    struct RecordingDatabase {
        table: Mutex<Option<TableInfo>>,
        created: TableInfo,
        executed: Mutex<Vec<Statement>>,
        rows: Vec<Vec<SqlValue>>,
        failing: Option<&'static str>,
    }

    impl RecordingDatabase {
        fn new(existing: bool) -> Self {
            let created = docs_table();
            Self {
                table: Mutex::new(existing.then(|| created.clone())),
                created,
                executed: Mutex::new(Vec::new()),
                rows: Vec::new(),
                failing: None,
            }
        }

        fn failing(mut self, fragment: &'static str) -> Self {
            self.failing = Some(fragment);
            self
        }

        fn executed(&self) -> Vec<Statement> {
            self.executed.lock().unwrap().clone()
        }
    }

    fn column(name: &str, declared: &str, primary_key: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            declared_type: declared.into(),
            nullable: !primary_key,
            primary_key,
        }
    }

    fn docs_table() -> TableInfo {
        TableInfo {
            name: "docs".into(),
            columns: vec![
                column("embedding_id", "UUID", true),
                column("doc_id", "TEXT", false),
                column("chunk", "BIGINT", false),
                column("embedding", "VECTOR(3)", false),
                column("text", "TEXT", false),
            ],
        }
    }

    fn options() -> OpenOptions {
        OpenOptions::new("docs", 3)
            .metadata_key(MetaDataKey::text("doc_id"))
            .metadata_key(
                MetaDataKey::new("chunk", embedstore_core::ColumnKind::Integer)
                    .allow_null(true)
                    .with_flag(ColumnFlags::NATURAL_KEY_EXCLUDED),
            )
    }

    #[async_trait]
    impl Database for RecordingDatabase {
        async fn product(&self) -> Result<DatabaseProduct, EmbedStoreError> {
            Ok(DatabaseProduct::Other("recording".into()))
        }

        async fn describe_table(&self, _table: &str) -> Result<Option<TableInfo>, EmbedStoreError> {
            Ok(self.table.lock().unwrap().clone())
        }

        async fn execute(
            &self,
            _transaction: Option<&TransactionId>,
            statements: Vec<Statement>,
        ) -> Result<u64, EmbedStoreError> {
            if statements.iter().any(|s| s.sql.starts_with("CREATE TABLE")) {
                *self.table.lock().unwrap() = Some(self.created.clone());
            }
            let count = statements.len() as u64;
            let rejected = self
                .failing
                .is_some_and(|fragment| statements.iter().any(|s| s.sql.contains(fragment)));
            self.executed.lock().unwrap().extend(statements);
            if rejected {
                return Err(EmbedStoreError::Database("statement rejected".into()));
            }
            Ok(count)
        }

        async fn query(
            &self,
            _transaction: Option<&TransactionId>,
            statement: Statement,
            _columns: &[ColumnType],
        ) -> Result<Vec<Vec<SqlValue>>, EmbedStoreError> {
            self.executed.lock().unwrap().push(statement);
            Ok(self.rows.clone())
        }

        async fn begin(&self) -> Result<TransactionId, EmbedStoreError> {
            Ok(TransactionId::new())
        }

        async fn commit(&self, _transaction: &TransactionId) -> Result<(), EmbedStoreError> {
            Ok(())
        }

        async fn rollback(&self, _transaction: &TransactionId) -> Result<(), EmbedStoreError> {
            Ok(())
        }
    }

    fn segment(doc: &str, chunk: i64) -> TextSegment {
        let mut metadata = embedstore_core::Metadata::new();
        metadata.insert("doc_id".into(), json!(doc));
        metadata.insert("chunk".into(), json!(chunk));
        TextSegment::with_metadata(format!("{doc}-{chunk}"), metadata)
    }

    #[tokio::test]
    async fn creates_missing_table_with_indexes() {
        let db = Arc::new(RecordingDatabase::new(false));
        let store = TableStore::open(db.clone(), &options()).await.unwrap();

        assert!(store.schema().was_just_created());
        assert!(store.schema().has_text());
        assert_eq!(store.schema().dimension(), 3);

        let sql: Vec<String> = db.executed().into_iter().map(|s| s.sql).collect();
        assert_eq!(
            sql[0],
            "CREATE TABLE \"docs\" (\"embedding_id\" UUID NOT NULL PRIMARY KEY, \"doc_id\" TEXT NOT NULL, \"chunk\" BIGINT, \"embedding\" VECTOR(3) NOT NULL, \"text\" TEXT)"
        );
        assert!(sql[1].starts_with("CREATE INDEX IF NOT EXISTS \"_es_meta_docs\""));
        assert!(sql[2].starts_with("CREATE INDEX IF NOT EXISTS \"_es_embedding_docs\""));
    }

    #[tokio::test]
    async fn index_failures_do_not_fail_open() {
        let db = Arc::new(RecordingDatabase::new(false).failing("CREATE INDEX"));
        let store = TableStore::open(db.clone(), &options()).await.unwrap();

        assert!(store.schema().was_just_created());
        let attempted = db
            .executed()
            .iter()
            .filter(|s| s.sql.starts_with("CREATE INDEX"))
            .count();
        assert_eq!(attempted, 2);
    }

    #[tokio::test]
    async fn failing_vector_index_falls_back_to_plain_index() {
        let db = Arc::new(RecordingDatabase::new(false).failing("USING ivfflat"));
        let store = TableStore::open_with_dialect(
            db.clone(),
            Arc::new(crate::dialect::PostgresDialect),
            &options(),
        )
        .await
        .unwrap();
        assert!(store.schema().was_just_created());

        let sql: Vec<String> = db.executed().into_iter().map(|s| s.sql).collect();
        let ivfflat = sql.iter().position(|s| s.contains("USING ivfflat")).unwrap();
        assert_eq!(
            sql[ivfflat + 1],
            "CREATE INDEX IF NOT EXISTS \"_es_embedding_docs\" ON \"docs\" (\"embedding\")"
        );
    }

    #[tokio::test]
    async fn missing_table_without_create_is_schema_error() {
        let db = Arc::new(RecordingDatabase::new(false));
        let err = TableStore::open(db, &options().create_if_missing(false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EmbedStoreError::Schema(m) if m.contains("missing table")));
    }

    #[tokio::test]
    async fn fresh_table_skips_deletes() {
        let db = Arc::new(RecordingDatabase::new(false));
        let store = TableStore::open(db.clone(), &options()).await.unwrap();
        let before = db.executed().len();

        store
            .add_all_generated(&[vec![1.0, 0.0, 0.0]], Some(&[segment("d1", 0)]))
            .await
            .unwrap();

        let written = &db.executed()[before..];
        assert_eq!(written.len(), 1);
        assert!(written[0].sql.starts_with("INSERT INTO \"docs\""));
        assert_eq!(written[0].params[1], SqlValue::Text("[1,0,0]".into()));
        assert_eq!(written[0].params[4], SqlValue::Text("d1-0".into()));
    }

    #[tokio::test]
    async fn existing_table_deletes_once_per_natural_key() {
        let db = Arc::new(RecordingDatabase::new(true));
        let store = TableStore::open(db.clone(), &options()).await.unwrap();
        assert!(!store.schema().was_just_created());

        let vectors = vec![vec![1.0, 0.0, 0.0]; 3];
        let segments = [segment("d1", 0), segment("d1", 1), segment("d2", 0)];
        store
            .add_all_generated(&vectors, Some(&segments))
            .await
            .unwrap();

        let executed = db.executed();
        let deletes: Vec<&Statement> = executed
            .iter()
            .filter(|s| s.sql.starts_with("DELETE"))
            .collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].sql, "DELETE FROM \"docs\" WHERE \"doc_id\" = ?1");
        assert_eq!(deletes[0].params, vec![SqlValue::Text("d1".into())]);
        assert_eq!(deletes[1].params, vec![SqlValue::Text("d2".into())]);
        assert_eq!(
            executed
                .iter()
                .filter(|s| s.sql.starts_with("INSERT"))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn length_mismatch_writes_nothing() {
        let db = Arc::new(RecordingDatabase::new(true));
        let store = TableStore::open(db.clone(), &options()).await.unwrap();
        let before = db.executed().len();

        let err = store
            .add_all(&["x".to_string()], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedStoreError::Validation(_)));
        assert_eq!(db.executed().len(), before);

        store.add_all(&[], &[], None).await.unwrap();
        assert_eq!(db.executed().len(), before);
    }

    #[tokio::test]
    async fn wrong_dimension_and_bad_id_are_validation_errors() {
        let db = Arc::new(RecordingDatabase::new(true));
        let store = TableStore::open(db, &options()).await.unwrap();

        let err = store
            .add(vec![1.0, 0.0], Some(segment("d1", 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedStoreError::Validation(_)));

        let err = store
            .add_all(
                &["a".to_string()],
                &[vec![1.0, 0.0, 0.0]],
                Some(&[segment("d1", 0)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedStoreError::Validation(m) if m.contains("UUID")));
    }

    #[tokio::test]
    async fn search_maps_rows_and_post_filters() {
        let id = Uuid::new_v4();
        let mut db = RecordingDatabase::new(true);
        db.rows = vec![
            vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Text("[1,0,0]".into()),
                SqlValue::Text("hello".into()),
                SqlValue::Text("d1".into()),
                SqlValue::Null,
                SqlValue::Double(1.0),
            ],
            vec![
                SqlValue::Text(Uuid::new_v4().to_string()),
                SqlValue::Text("[0,1,0]".into()),
                SqlValue::Null,
                SqlValue::Text("d2".into()),
                SqlValue::Integer(4),
                SqlValue::Double(0.5),
            ],
        ];
        let db = Arc::new(db);
        let store = TableStore::open(db.clone(), &options()).await.unwrap();

        let request = SearchRequest::new(vec![1.0, 0.0, 0.0]).with_max_results(5);
        let matches = store.search(&request).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, id.to_string());
        assert_eq!(matches[0].text.as_deref(), Some("hello"));
        assert_eq!(matches[0].embedding, vec![1.0, 0.0, 0.0]);
        assert!(!matches[0].metadata.contains_key("chunk"));
        assert_eq!(matches[1].metadata["chunk"], json!(4));
        assert_eq!(matches[1].text, None);

        let query = db.executed().last().cloned().unwrap();
        assert!(query.sql.contains("vector_score(\"embedding\", ?1) AS \"embedstore_score\""));
        assert!(query.sql.ends_with("ORDER BY \"embedstore_score\" DESC LIMIT ?3"));
        assert_eq!(query.params[2], SqlValue::Integer(5));

        let filtered = store
            .search(&request.with_filter(MetadataFilter::equals("doc_id", "d3")))
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn search_rejects_bad_requests() {
        let db = Arc::new(RecordingDatabase::new(true));
        let store = TableStore::open(db.clone(), &options()).await.unwrap();

        let zero = SearchRequest::new(vec![1.0, 0.0, 0.0]).with_max_results(0);
        assert!(matches!(
            store.search(&zero).await,
            Err(EmbedStoreError::Validation(_))
        ));
        let nan = SearchRequest::new(vec![1.0, 0.0, 0.0]).with_min_score(f64::NAN);
        assert!(store.search(&nan).await.is_err());
        let short = SearchRequest::new(vec![1.0]);
        assert!(store.search(&short).await.is_err());
        let before = db.executed().len();
        let zeros = SearchRequest::new(vec![0.0, 0.0, 0.0]);
        assert!(matches!(
            store.search(&zeros).await,
            Err(EmbedStoreError::Validation(m)) if m.contains("zeros")
        ));
        let infinite = SearchRequest::new(vec![f32::INFINITY, 0.0, 0.0]);
        assert!(matches!(
            store.search(&infinite).await,
            Err(EmbedStoreError::Validation(_))
        ));
        assert_eq!(db.executed().len(), before);
    }

    #[tokio::test]
    async fn with_transaction_shares_schema() {
        let db = Arc::new(RecordingDatabase::new(true));
        let store = TableStore::open(db, &options()).await.unwrap();
        let tx = TransactionId::from("tx-1");
        let bound = store.with_transaction(Some(tx.clone()));

        assert_eq!(bound.transaction(), Some(&tx));
        assert!(store.transaction().is_none());
        assert!(std::ptr::eq(bound.schema(), store.schema()));
    }
}
