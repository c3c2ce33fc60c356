use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use embedstore_core::{
    Database, EmbedStoreError, Embeddings, Loader, MetaDataKey, Metadata, SearchMatch,
    SearchRequest, TextSegment, TransactionId,
};
use embedstore_sql::{dialect_for, OpenOptions, SchemaManager, TableSchema, TableStore};
use embedstore_splitters::{ParagraphSplitter, TextSplitter, INDEX_METADATA_KEY};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::config::StoreConfig;
use crate::coordinator::PendingTracker;
use crate::scheduler::{TaskScheduler, TokioScheduler};

/// Text embedded to learn the dimension when neither the caller nor the table gives one.
const DIMENSION_SAMPLE_TEXT: &str = "dimension sample";

/// What to search for.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Embedded with the store's provider before searching.
    Text(String),
    Vector(Vec<f32>),
}

impl From<&str> for SearchQuery {
    fn from(text: &str) -> Self {
        SearchQuery::Text(text.to_string())
    }
}

impl From<String> for SearchQuery {
    fn from(text: String) -> Self {
        SearchQuery::Text(text)
    }
}

impl From<Vec<f32>> for SearchQuery {
    fn from(vector: Vec<f32>) -> Self {
        SearchQuery::Vector(vector)
    }
}

impl From<&[f32]> for SearchQuery {
    fn from(vector: &[f32]) -> Self {
        SearchQuery::Vector(vector.to_vec())
    }
}

/// Completion handle for a background embedding job.
///
/// Dropping it does not cancel the job.
#[must_use = "dropping an EmbedJob discards the job's outcome"]
#[derive(Debug)]
pub struct EmbedJob {
    rx: oneshot::Receiver<Result<usize, EmbedStoreError>>,
}

impl EmbedJob {
    fn finished(result: Result<usize, EmbedStoreError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for the job and return the number of rows it wrote.
    pub async fn wait(self) -> Result<usize, EmbedStoreError> {
        self.rx.await.map_err(|_| {
            EmbedStoreError::Embedding("embedding job was dropped before it finished".to_string())
        })?
    }
}

/// Embeds text in the background and answers searches that see every earlier write.
///
/// `embed` and `embed_document` return as soon as the job is queued. Every search first
/// waits until all jobs queued before it have finished, whether they succeeded or not.
/// Cloning is cheap; clones share the table, the scheduler and the pending count.
#[derive(Clone)]
pub struct EmbeddingStore {
    table: TableStore,
    embeddings: Arc<dyn Embeddings>,
    scheduler: Arc<dyn TaskScheduler>,
    tracker: PendingTracker,
    drain_timeout: Option<Duration>,
}

impl EmbeddingStore {
    pub fn builder(
        db: Arc<dyn Database>,
        embeddings: Arc<dyn Embeddings>,
    ) -> EmbeddingStoreBuilder {
        EmbeddingStoreBuilder::new(db, embeddings)
    }

    /// A store over an already opened table.
    pub fn new(
        table: TableStore,
        embeddings: Arc<dyn Embeddings>,
        scheduler: Arc<dyn TaskScheduler>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            table,
            embeddings,
            scheduler,
            tracker: PendingTracker::new(),
            drain_timeout: config.drain_timeout(),
        }
    }

    pub fn table(&self) -> &TableStore {
        &self.table
    }

    pub fn schema(&self) -> &TableSchema {
        self.table.schema()
    }

    pub fn tracker(&self) -> &PendingTracker {
        &self.tracker
    }

    /// Number of embedding jobs queued or running.
    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// A handle writing and reading inside `transaction`, sharing everything else.
    pub fn with_transaction(&self, transaction: Option<TransactionId>) -> Self {
        Self {
            table: self.table.with_transaction(transaction),
            ..self.clone()
        }
    }

    /// Embed `texts` in the background and store one row per text.
    ///
    /// `metadata`, when given, must hold one map per text.
    pub fn embed<I, S>(&self, texts: I, metadata: Option<Vec<Metadata>>) -> EmbedJob
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let texts: Vec<String> = texts.into_iter().map(Into::into).collect();
        let store = self.clone();
        self.spawn_job("embed", async move { store.embed_now(texts, metadata).await })
    }

    /// Load, split and embed documents in the background.
    ///
    /// Each segment carries its document's metadata, overridden by `metadata`, plus
    /// its position within the document under `index`.
    pub fn embed_document(
        &self,
        loader: Arc<dyn Loader>,
        max_segment_chars: usize,
        overlap_chars: usize,
        metadata: Option<Metadata>,
    ) -> EmbedJob {
        if max_segment_chars == 0 || overlap_chars >= max_segment_chars {
            return EmbedJob::finished(Err(EmbedStoreError::Validation(format!(
                "segment size {max_segment_chars} with overlap {overlap_chars}: size must be \
                 positive and larger than the overlap"
            ))));
        }
        let store = self.clone();
        self.spawn_job("embed_document", async move {
            let documents = loader.load().await?;
            let splitter = ParagraphSplitter::new(max_segment_chars, overlap_chars);
            let chunks = splitter.split_documents(documents);

            let mut texts = Vec::with_capacity(chunks.len());
            let mut metadatas = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                let mut merged = chunk.metadata;
                let index = merged.remove(INDEX_METADATA_KEY).unwrap_or(Value::Null);
                if let Some(caller) = &metadata {
                    merged.extend(caller.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                merged.insert(INDEX_METADATA_KEY.to_string(), index);
                texts.push(chunk.content);
                metadatas.push(merged);
            }
            store.embed_now(texts, Some(metadatas)).await
        })
    }

    /// Embed a query text with the store's provider.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedStoreError> {
        self.embeddings.embed_query(text).await
    }

    /// Wait for every queued embedding job, honouring the configured timeout.
    pub async fn drain(&self) -> Result<(), EmbedStoreError> {
        match self.drain_timeout {
            Some(timeout) => self.tracker.drain_timeout(timeout).await,
            None => {
                self.tracker.drain().await;
                Ok(())
            }
        }
    }

    /// Search after all earlier embedding jobs have finished.
    pub async fn search(
        &self,
        query: impl Into<SearchQuery>,
        max_results: usize,
        min_score: Option<f64>,
    ) -> Result<Vec<SearchMatch>, EmbedStoreError> {
        self.drain().await?;
        let query_vector = match query.into() {
            SearchQuery::Text(text) => self.embeddings.embed_query(&text).await?,
            SearchQuery::Vector(vector) => vector,
        };
        let mut request = SearchRequest::new(query_vector).with_max_results(max_results);
        if let Some(min_score) = min_score {
            request = request.with_min_score(min_score);
        }
        self.table.search(&request).await
    }

    /// Run a prepared request after all earlier embedding jobs have finished.
    pub async fn search_request(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<SearchMatch>, EmbedStoreError> {
        self.drain().await?;
        self.table.search(request).await
    }

    async fn embed_now(
        &self,
        texts: Vec<String>,
        metadata: Option<Vec<Metadata>>,
    ) -> Result<usize, EmbedStoreError> {
        if let Some(metadata) = &metadata {
            if metadata.len() != texts.len() {
                return Err(EmbedStoreError::Validation(format!(
                    "{} metadata maps for {} texts",
                    metadata.len(),
                    texts.len()
                )));
            }
        }
        if texts.is_empty() {
            return Ok(0);
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.embeddings.embed_documents(&refs).await?;
        if vectors.len() != texts.len() {
            return Err(EmbedStoreError::Embedding(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        let segments: Vec<TextSegment> = match metadata {
            Some(metadata) => texts
                .into_iter()
                .zip(metadata)
                .map(|(text, metadata)| TextSegment::with_metadata(text, metadata))
                .collect(),
            None => texts.into_iter().map(TextSegment::new).collect(),
        };
        self.table
            .add_all_generated(&vectors, Some(&segments))
            .await?;
        Ok(segments.len())
    }

    /// Count the job as pending now, then hand it to the scheduler.
    fn spawn_job<F>(&self, kind: &'static str, work: F) -> EmbedJob
    where
        F: Future<Output = Result<usize, EmbedStoreError>> + Send + 'static,
    {
        let guard = self.tracker.begin();
        let (tx, rx) = oneshot::channel();
        let table = self.table.schema().table_name().to_string();
        self.scheduler.submit(Box::pin(async move {
            let result = work.await;
            match &result {
                Ok(rows) => debug!(table = %table, kind, rows, "embedding job finished"),
                Err(e) => error!(table = %table, kind, error = %e, "embedding job failed"),
            }
            // Release before notifying so a waiter that then searches sees zero pending.
            drop(guard);
            let _ = tx.send(result);
        }));
        EmbedJob { rx }
    }
}

/// Builds an [`EmbeddingStore`], creating or validating its table.
///
/// Metadata keys come from, in order: the declared keys, the primary key of
/// [`source_table`](Self::source_table), or the columns of an existing embeddings
/// table. The text flag and the dimension are also read from an existing table when
/// unset. A new table without a declared dimension gets the length of a sample
/// embedding, and stores no text unless [`store_text`](Self::store_text) is set.
pub struct EmbeddingStoreBuilder {
    db: Arc<dyn Database>,
    embeddings: Arc<dyn Embeddings>,
    table_name: Option<String>,
    metadata_keys: Option<Vec<MetaDataKey>>,
    source_table: Option<String>,
    dimension: Option<usize>,
    recreate: bool,
    create_if_missing: bool,
    store_text: Option<bool>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    config: StoreConfig,
}

impl EmbeddingStoreBuilder {
    pub fn new(db: Arc<dyn Database>, embeddings: Arc<dyn Embeddings>) -> Self {
        Self {
            db,
            embeddings,
            table_name: None,
            metadata_keys: None,
            source_table: None,
            dimension: None,
            recreate: false,
            create_if_missing: true,
            store_text: None,
            scheduler: None,
            config: StoreConfig::default(),
        }
    }

    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    pub fn metadata_key(mut self, key: MetaDataKey) -> Self {
        self.metadata_keys.get_or_insert_with(Vec::new).push(key);
        self
    }

    /// Declare the full key list, possibly empty.
    pub fn metadata_keys(mut self, keys: Vec<MetaDataKey>) -> Self {
        self.metadata_keys = Some(keys);
        self
    }

    /// Shortcut for a non-null text metadata column.
    pub fn metadata_column(self, name: impl Into<String>) -> Self {
        self.metadata_key(MetaDataKey::text(name))
    }

    /// Use the primary key columns of `table` as metadata keys when none are declared.
    pub fn source_table(mut self, table: impl Into<String>) -> Self {
        self.source_table = Some(table.into());
        self
    }

    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Drop and recreate the table on build.
    pub fn recreate(mut self, recreate: bool) -> Self {
        self.recreate = recreate;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn store_text(mut self, store_text: bool) -> Self {
        self.store_text = Some(store_text);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn build(self) -> Result<EmbeddingStore, EmbedStoreError> {
        let table_name = self.table_name.ok_or_else(|| {
            EmbedStoreError::Configuration("a table name is required".to_string())
        })?;
        let scheduler: Arc<dyn TaskScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::try_current()?),
        };

        let product = self.db.product().await?;
        let dialect = dialect_for(&product);
        let derived = if self.metadata_keys.is_none()
            || self.store_text.is_none()
            || self.dimension.is_none()
        {
            SchemaManager::derive(self.db.as_ref(), dialect.as_ref(), &table_name).await?
        } else {
            None
        };

        let source_keys = match (&self.metadata_keys, &self.source_table) {
            (None, Some(source)) => Some(
                SchemaManager::primary_key_metadata(self.db.as_ref(), dialect.as_ref(), source)
                    .await?
                    .ok_or_else(|| {
                        EmbedStoreError::Configuration(format!(
                            "source table '{source}' does not exist"
                        ))
                    })?,
            ),
            _ => None,
        };

        let metadata_keys = match (self.metadata_keys, source_keys, &derived) {
            (Some(keys), _, _) => keys,
            (None, Some(keys), _) => keys,
            (None, None, Some(derived)) => derived.metadata_keys.clone(),
            (None, None, None) => {
                return Err(EmbedStoreError::Configuration(format!(
                    "no metadata keys declared and table '{table_name}' does not exist"
                )))
            }
        };
        let store_text = self
            .store_text
            .or(derived.as_ref().map(|d| d.store_text))
            .unwrap_or(false);
        let dimension = match (self.dimension, &derived) {
            (Some(dimension), _) => dimension,
            (None, Some(derived)) if derived.dimension > 0 && !self.recreate => derived.dimension,
            (None, _) => sample_dimension(self.embeddings.as_ref()).await?,
        };

        let options = OpenOptions::new(table_name, dimension)
            .metadata_keys(metadata_keys)
            .create_if_missing(self.create_if_missing)
            .drop_first(self.recreate)
            .store_text(store_text)
            .embedding_list_size(self.config.embedding_list_size);
        let table = TableStore::open_with_dialect(self.db, dialect, &options).await?;
        info!(
            table = %options.table_name,
            product = ?product,
            dimension,
            created = table.schema().was_just_created(),
            "embedding store ready"
        );
        Ok(EmbeddingStore::new(
            table,
            self.embeddings,
            scheduler,
            &self.config,
        ))
    }
}

async fn sample_dimension(embeddings: &dyn Embeddings) -> Result<usize, EmbedStoreError> {
    let sample = embeddings.embed_query(DIMENSION_SAMPLE_TEXT).await?;
    if sample.is_empty() {
        return Err(EmbedStoreError::Embedding(
            "provider returned an empty vector for the dimension sample".to_string(),
        ));
    }
    Ok(sample.len())
}
