use std::sync::Arc;

use embedstore::embeddings::FakeEmbeddings;
use embedstore::loaders::TextLoader;
use embedstore::sqlite::SqliteDatabase;
use embedstore::{
    ColumnKind, EmbedStoreError, EmbeddingStore, MetaDataKey, Metadata, StoreConfig,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), EmbedStoreError> {
    tracing_subscriber::fmt::init();

    // --- Open the store ---
    println!("=== Opening Store ===");
    let db = Arc::new(SqliteDatabase::in_memory()?);
    let store = EmbeddingStore::builder(db, Arc::new(FakeEmbeddings::new(16)))
        .table_name("notes")
        .metadata_column("topic")
        .metadata_key(MetaDataKey::new("index", ColumnKind::Integer).allow_null(true))
        .store_text(true)
        .config(StoreConfig::from_env()?)
        .build()
        .await?;
    println!(
        "Table '{}' with dimension {}",
        store.schema().table_name(),
        store.schema().dimension()
    );

    // --- Embed in the background ---
    println!("\n=== Embedding ===");
    let notes = [
        ("Rust guarantees memory safety without a garbage collector.", "rust"),
        ("Python is popular for data science and scripting.", "python"),
        ("SQLite is an embedded relational database.", "databases"),
    ];
    for (text, topic) in notes {
        let mut metadata = Metadata::new();
        metadata.insert("topic".into(), json!(topic));
        // Fire and forget: the next search waits for this job.
        let _ = store.embed([text], Some(vec![metadata]));
    }

    let mut metadata = Metadata::new();
    metadata.insert("topic".into(), json!("postgres"));
    let loader = TextLoader::new(
        "pg",
        "PostgreSQL is a relational database.\n\npgvector adds a vector type and similarity operators.",
    );
    let job = store.embed_document(Arc::new(loader), 60, 10, Some(metadata));
    println!("{} job(s) pending", store.pending());
    println!("Document job wrote {} segment(s)", job.wait().await?);

    // --- Search ---
    println!("\n=== Search ===");
    for query in ["memory safety", "relational database"] {
        println!("Top 2 for '{query}':");
        for m in store.search(query, 2, None).await? {
            println!(
                "  {:.4}  [{}] {}",
                m.score,
                m.metadata.get("topic").and_then(|v| v.as_str()).unwrap_or("-"),
                m.text.as_deref().unwrap_or("")
            );
        }
    }

    println!("\nTable RAG demo completed successfully!");
    Ok(())
}
