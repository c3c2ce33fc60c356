use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use embedstore::core::{Database, Statement};
use embedstore::embeddings::FakeEmbeddings;
use embedstore::loaders::TextLoader;
use embedstore::sqlite::SqliteDatabase;
use embedstore::{
    ColumnKind, EmbedStoreError, EmbeddingStore, Embeddings, ManualScheduler, MetaDataKey,
    Metadata, SearchRequest, StoreConfig, TokioScheduler,
};
use serde_json::json;

fn doc_metadata(doc_id: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("doc_id".into(), json!(doc_id));
    metadata
}

async fn store_with(
    db: Arc<SqliteDatabase>,
    embeddings: Arc<dyn Embeddings>,
    scheduler: Arc<dyn embedstore::TaskScheduler>,
    config: StoreConfig,
) -> EmbeddingStore {
    EmbeddingStore::builder(db, embeddings)
        .table_name("docs")
        .metadata_column("doc_id")
        .metadata_key(MetaDataKey::new("index", ColumnKind::Integer).allow_null(true))
        .store_text(true)
        .scheduler(scheduler)
        .config(config)
        .build()
        .await
        .unwrap()
}

/// Wraps [`FakeEmbeddings`] and takes a while to answer, like a remote provider.
struct SlowEmbeddings {
    inner: FakeEmbeddings,
    delay: Duration,
}

#[async_trait]
impl Embeddings for SlowEmbeddings {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedStoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_documents(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedStoreError> {
        self.inner.embed_query(text).await
    }
}

/// Fails every document batch but still answers queries.
struct BrokenEmbeddings(FakeEmbeddings);

#[async_trait]
impl Embeddings for BrokenEmbeddings {
    async fn embed_documents(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedStoreError> {
        Err(EmbedStoreError::Embedding("provider unavailable".into()))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedStoreError> {
        self.0.embed_query(text).await
    }
}

#[tokio::test]
async fn search_waits_for_queued_jobs() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let scheduler = ManualScheduler::new();
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(scheduler.clone()),
        StoreConfig::default(),
    )
    .await;

    for (text, doc_id) in [("alpha", "a"), ("beta", "b"), ("gamma", "c")] {
        let _ = store.embed([text], Some(vec![doc_metadata(doc_id)]));
    }
    assert_eq!(store.pending(), 3);
    assert_eq!(scheduler.pending_jobs(), 3);

    let search = tokio::spawn({
        let store = store.clone();
        async move { store.search("beta", 10, None).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!search.is_finished());

    assert_eq!(scheduler.run_all().await, 3);
    let matches = search.await.unwrap().unwrap();
    assert_eq!(matches.len(), 3);
    assert_eq!(matches[0].text.as_deref(), Some("beta"));
    assert!((matches[0].score - 1.0).abs() < 1e-6);
    assert_eq!(store.pending(), 0);
}

#[tokio::test]
async fn slow_provider_writes_are_visible_to_the_next_search() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let embeddings = Arc::new(SlowEmbeddings {
        inner: FakeEmbeddings::new(8),
        delay: Duration::from_millis(30),
    });
    let store = store_with(
        db,
        embeddings,
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    for i in 0..3 {
        let _ = store.embed(
            [format!("text {i}")],
            Some(vec![doc_metadata(&format!("d{i}"))]),
        );
    }
    let matches = store.search("text 1", 10, None).await.unwrap();
    assert_eq!(matches.len(), 3);
    assert_eq!(matches[0].text.as_deref(), Some("text 1"));
}

#[tokio::test]
async fn embed_job_reports_row_count() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    let job = store.embed(
        ["one", "two"],
        Some(vec![doc_metadata("d1"), doc_metadata("d2")]),
    );
    assert_eq!(job.wait().await.unwrap(), 2);
    assert_eq!(store.pending(), 0);
}

#[tokio::test]
async fn drain_timeout_fails_search_until_jobs_run() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let scheduler = ManualScheduler::new();
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(scheduler.clone()),
        StoreConfig::default().with_drain_timeout(Duration::from_millis(20)),
    )
    .await;

    let _ = store.embed(["late"], Some(vec![doc_metadata("d1")]));
    let err = store.search("late", 5, None).await.unwrap_err();
    assert!(matches!(err, EmbedStoreError::Timeout(_)), "{err}");

    scheduler.run_all().await;
    assert_eq!(store.search("late", 5, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_job_reaches_its_handle_not_the_search() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = store_with(
        db,
        Arc::new(BrokenEmbeddings(FakeEmbeddings::new(8))),
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    let job = store.embed(["lost"], Some(vec![doc_metadata("d1")]));
    let matches = store.search("lost", 5, None).await.unwrap();
    assert!(matches.is_empty());

    let err = job.wait().await.unwrap_err();
    assert!(matches!(err, EmbedStoreError::Embedding(_)));
    assert_eq!(store.pending(), 0);
}

#[tokio::test]
async fn metadata_count_mismatch_fails_the_job() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    let job = store.embed(["a", "b"], Some(vec![doc_metadata("d1")]));
    assert!(matches!(
        job.wait().await.unwrap_err(),
        EmbedStoreError::Validation(_)
    ));
}

#[tokio::test]
async fn embed_document_splits_and_merges_metadata() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    let mut loader_metadata = doc_metadata("from-loader");
    loader_metadata.insert("source".into(), json!("memory"));
    let loader = TextLoader::new("doc", "first paragraph\n\nsecond paragraph\n\nthird one")
        .with_metadata(loader_metadata);

    let job = store.embed_document(Arc::new(loader), 20, 0, Some(doc_metadata("manual")));
    assert_eq!(job.wait().await.unwrap(), 3);

    let matches = store.search("second paragraph", 3, None).await.unwrap();
    assert_eq!(matches.len(), 3);
    assert_eq!(matches[0].text.as_deref(), Some("second paragraph"));
    assert_eq!(matches[0].metadata["doc_id"], json!("manual"));
    assert_eq!(matches[0].metadata["index"], json!(1));
    assert!(!matches[0].metadata.contains_key("source"));
}

#[tokio::test]
async fn embed_document_rejects_bad_segment_sizes() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    let loader = Arc::new(TextLoader::new("doc", "text"));
    let job = store.embed_document(loader, 10, 10, None);
    assert!(matches!(
        job.wait().await.unwrap_err(),
        EmbedStoreError::Validation(_)
    ));
    assert_eq!(store.pending(), 0);
}

#[tokio::test]
async fn search_request_applies_filter_after_draining() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = store_with(
        db,
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(TokioScheduler::current()),
        StoreConfig::default(),
    )
    .await;

    let _ = store.embed(
        ["red", "green"],
        Some(vec![doc_metadata("r"), doc_metadata("g")]),
    );
    let query = store.embed_query("red").await.unwrap();
    let request = SearchRequest::new(query)
        .with_filter(embedstore::MetadataFilter::equals("doc_id", "g"));
    let matches = store.search_request(&request).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].text.as_deref(), Some("green"));
}

#[tokio::test]
async fn builder_derives_layout_from_existing_table() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let embeddings = Arc::new(FakeEmbeddings::new(6));
    let first = EmbeddingStore::builder(db.clone(), embeddings.clone())
        .table_name("docs")
        .metadata_column("doc_id")
        .store_text(false)
        .build()
        .await
        .unwrap();
    assert_eq!(first.schema().dimension(), 6);
    assert!(first.schema().was_just_created());

    let second = EmbeddingStore::builder(db, embeddings)
        .table_name("docs")
        .build()
        .await
        .unwrap();
    assert!(!second.schema().was_just_created());
    assert!(!second.schema().has_text());
    let names: Vec<&str> = second
        .schema()
        .metadata_keys()
        .iter()
        .map(|k| k.name.as_str())
        .collect();
    assert_eq!(names, vec!["doc_id"]);
}

#[tokio::test]
async fn builder_reuses_existing_dimension() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    EmbeddingStore::builder(db.clone(), Arc::new(FakeEmbeddings::new(6)))
        .table_name("docs")
        .metadata_column("doc_id")
        .build()
        .await
        .unwrap();

    let reopened = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(4)))
        .table_name("docs")
        .build()
        .await
        .unwrap();
    assert_eq!(reopened.schema().dimension(), 6);
}

#[tokio::test]
async fn builder_stores_no_text_by_default() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let store = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(4)))
        .table_name("docs")
        .metadata_column("doc_id")
        .build()
        .await
        .unwrap();
    assert!(!store.schema().has_text());

    let _ = store.embed(["plain"], Some(vec![doc_metadata("d1")]));
    let matches = store.search("plain", 1, None).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].text, None);
}

#[tokio::test]
async fn builder_takes_keys_from_source_table_primary_key() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    db.execute(
        None,
        vec![Statement::new(
            "CREATE TABLE orders (region TEXT, order_no INTEGER, note TEXT, PRIMARY KEY (region, order_no))",
        )],
    )
    .await
    .unwrap();

    let store = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(4)))
        .table_name("order_embeddings")
        .source_table("orders")
        .build()
        .await
        .unwrap();
    let keys: Vec<(&str, ColumnKind, bool)> = store
        .schema()
        .metadata_keys()
        .iter()
        .map(|k| (k.name.as_str(), k.kind, k.allow_null))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("region", ColumnKind::Text, false),
            ("order_no", ColumnKind::Integer, false),
        ]
    );
}

#[tokio::test]
async fn builder_with_missing_source_table_is_configuration_error() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let err = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(4)))
        .table_name("docs")
        .source_table("absent")
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EmbedStoreError::Configuration(_)), "{err}");
}

#[tokio::test]
async fn builder_without_keys_or_table_is_configuration_error() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let err = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(4)))
        .table_name("nothing_here")
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EmbedStoreError::Configuration(_)), "{err}");
}

#[tokio::test]
async fn transaction_handles_share_the_pending_count() {
    let db = Arc::new(SqliteDatabase::in_memory().unwrap());
    let scheduler = ManualScheduler::new();
    let store = store_with(
        db.clone(),
        Arc::new(FakeEmbeddings::new(8)),
        Arc::new(scheduler.clone()),
        StoreConfig::default(),
    )
    .await;

    let tx = db.begin().await.unwrap();
    let bound = store.with_transaction(Some(tx.clone()));
    let job = bound.embed(["inside"], Some(vec![doc_metadata("d1")]));
    assert_eq!(store.pending(), 1);

    scheduler.run_all().await;
    assert_eq!(job.wait().await.unwrap(), 1);
    assert_eq!(bound.search("inside", 5, None).await.unwrap().len(), 1);
    db.rollback(&tx).await.unwrap();
    assert!(store.search("inside", 5, None).await.unwrap().is_empty());
}
