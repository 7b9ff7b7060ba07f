//! Query command implementation

use crate::config::Config;
use crate::embed::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::query::{
    MetadataFilter, Modality, QueryRequest, QueryRunner, ScopeFilter, SearchHit, SearchMode,
};
use crate::snapshot::SnapshotLoader;
use crate::storage::Storage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Query options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Number of results (defaults to `query.default_k`)
    pub k: Option<usize>,
    pub mode: Option<SearchMode>,
    /// Image file to search with instead of text
    pub image: Option<PathBuf>,
    pub modalities: Option<Vec<Modality>>,
    pub scope: ScopeFilter,
    pub metadata: Option<MetadataFilter>,
}

/// Query result
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub snapshot_id: String,
    pub results: Vec<SearchHit>,
}

/// Execute a query against the latest published snapshot
pub async fn cmd_query(
    config: &Config,
    storage: &Storage,
    query: &str,
    options: QueryOptions,
) -> Result<QueryResult> {
    let embedder = create_embedder(&config.embedding)?;
    cmd_query_with(config, storage, embedder, query, options).await
}

/// Same as [`cmd_query`] with an explicit embedder
pub async fn cmd_query_with(
    config: &Config,
    storage: &Storage,
    embedder: Arc<dyn Embedder>,
    query: &str,
    options: QueryOptions,
) -> Result<QueryResult> {
    info!("Executing query: {}", query);

    let image_bytes = match &options.image {
        Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
            Error::Validation(format!("cannot read image {}: {}", path.display(), e))
        })?),
        None => None,
    };

    let loader = SnapshotLoader::new(storage.clone(), config.paths.snapshot_cache_dir.clone());
    let snapshot = loader.load_latest().await?;
    let runner = QueryRunner::new(embedder, &config.query);

    let request = QueryRequest {
        query_text: Some(query.to_string()).filter(|q| !q.trim().is_empty()),
        image_bytes,
        top_k: options.k.unwrap_or(config.query.default_k),
        modalities: options.modalities,
        mode: options.mode,
        scope: options.scope,
        metadata: options.metadata,
    };
    let results = runner.run(&snapshot, &request).await?;

    Ok(QueryResult {
        query: query.to_string(),
        snapshot_id: snapshot.id().to_string(),
        results,
    })
}

/// Print query results to console
pub fn print_query_results(result: &QueryResult) {
    println!("\n🔍 Query: {}  (snapshot {})\n", result.query, result.snapshot_id);
    println!("Found {} results:\n", result.results.len());

    for (i, hit) in result.results.iter().enumerate() {
        println!(
            "{}. [score: {:.3}] {} {} (asset {})",
            i + 1,
            hit.score,
            hit.modality,
            hit.id,
            hit.media_asset_id
        );
        if let Some(position) = hit.position_ms {
            println!("   at {} ms", position);
        }
        if let Some(snippet) = &hit.snippet {
            println!("   {}", snippet.replace('\n', " "));
        }
        println!();
    }
}
