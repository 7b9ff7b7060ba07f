//! Default values for configuration

/// Default storage backend
pub fn default_storage_backend() -> String {
    "local".to_string()
}

/// Default versioned root prefix for all layout paths
pub fn default_storage_prefix() -> String {
    "v1".to_string()
}

/// Default AWS region for the s3 backend
pub fn default_storage_region() -> String {
    std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string())
}

/// Default HNSW neighbor fan-out
pub fn default_index_m() -> usize {
    16
}

/// Default HNSW build-time candidate list size
pub fn default_index_ef_construction() -> usize {
    200
}

/// Default HNSW query-time candidate list size
pub fn default_index_ef_search() -> usize {
    64
}

/// Default number of results
pub fn default_query_k() -> usize {
    10
}

/// Default maximum results allowed per request
pub fn default_query_max_results() -> usize {
    100
}

/// Default query embedding cache capacity (entries)
pub fn default_query_cache_capacity() -> usize {
    1024
}

/// Default embedding call timeout
pub fn default_query_embed_timeout_ms() -> u64 {
    10_000
}

/// Default keyword weight in hybrid mode (0.0 - 1.0)
pub fn default_query_keyword_weight() -> f32 {
    0.3
}

/// Compaction: batches below this size keep accumulating (64 MiB)
pub fn default_compaction_target_min_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Compaction: hard upper bound on a batch (512 MiB)
pub fn default_compaction_target_max_bytes() -> u64 {
    512 * 1024 * 1024
}

/// Compaction: maximum input files per batch
pub fn default_compaction_max_files_per_batch() -> usize {
    256
}

/// Compaction: maximum batches per run
pub fn default_compaction_max_batches() -> usize {
    32
}

/// Idempotency: PROCESSING records older than this may be retried
pub fn default_guard_ttl_secs() -> u64 {
    15 * 60
}

/// Batcher: flush once this many items are queued
pub fn default_batcher_max_batch_size() -> usize {
    500
}

/// Batcher: flush at least this often
pub fn default_batcher_max_latency_ms() -> u64 {
    2_000
}

/// Batcher: enqueue fails once this many items are waiting
pub fn default_batcher_backlog_cap() -> usize {
    10_000
}

/// Default embedding backend URL
pub fn default_embedding_backend_url() -> String {
    std::env::var("MEDIAGRAPH_EMBEDDING_BACKEND_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7997".to_string())
}

/// Default embedding model identifier passed to the backend
pub fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

/// Default image embedding model identifier passed to the backend
pub fn default_embedding_image_model() -> String {
    "openai/clip-vit-base-patch32".to_string()
}

/// Default batch size for embedding calls
pub fn default_embedding_batch_size() -> usize {
    32
}
