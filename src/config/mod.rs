//! Configuration management for mediagraph
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Object storage location of the columnar store
    #[serde(default)]
    pub storage: StorageConfig,

    /// ANN index construction parameters
    #[serde(default)]
    pub index: IndexConfig,

    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Compaction policy
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Idempotency guard configuration
    #[serde(default)]
    pub guard: GuardConfig,

    /// Ingestion batcher configuration
    #[serde(default)]
    pub batcher: BatcherConfig,

    /// Embedding backend configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind: "local", "memory" or "s3"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Root directory for the local backend (defaults to <base_dir>/store)
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Bucket name for the s3 backend
    #[serde(default)]
    pub bucket: Option<String>,

    /// Region for the s3 backend
    #[serde(default = "default_storage_region")]
    pub region: String,

    /// Versioned root prefix under which the layout lives
    #[serde(default = "default_storage_prefix")]
    pub prefix: String,
}

/// ANN index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Neighbor fan-out per graph node
    #[serde(default = "default_index_m")]
    pub m: usize,

    /// Candidate list size while building
    #[serde(default = "default_index_ef_construction")]
    pub ef_construction: usize,

    /// Candidate list size while searching
    #[serde(default = "default_index_ef_search")]
    pub ef_search: usize,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results
    #[serde(default = "default_query_k")]
    pub default_k: usize,

    /// Maximum results allowed
    #[serde(default = "default_query_max_results")]
    pub max_results: usize,

    /// Query embedding LRU capacity
    #[serde(default = "default_query_cache_capacity")]
    pub cache_capacity: usize,

    /// Timeout for a single embedding call (milliseconds)
    #[serde(default = "default_query_embed_timeout_ms")]
    pub embed_timeout_ms: u64,

    /// Keyword weight when hybrid mode is used (0.0 - 1.0)
    #[serde(default = "default_query_keyword_weight")]
    pub keyword_weight: f32,
}

/// Compaction policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_compaction_target_min_bytes")]
    pub target_min_bytes: u64,

    #[serde(default = "default_compaction_target_max_bytes")]
    pub target_max_bytes: u64,

    #[serde(default = "default_compaction_max_files_per_batch")]
    pub max_files_per_batch: usize,

    #[serde(default = "default_compaction_max_batches")]
    pub max_batches: usize,
}

/// Idempotency guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Seconds after which a PROCESSING record is considered abandoned
    #[serde(default = "default_guard_ttl_secs")]
    pub ttl_secs: u64,
}

/// Batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    #[serde(default = "default_batcher_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_batcher_max_latency_ms")]
    pub max_latency_ms: u64,

    #[serde(default = "default_batcher_backlog_cap")]
    pub backlog_cap: usize,
}

/// Embedding backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the HTTP embedding backend
    #[serde(default = "default_embedding_backend_url")]
    pub backend_url: String,

    /// Text model identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Image model identifier
    #[serde(default = "default_embedding_image_model")]
    pub image_model: String,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for mediagraph data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to the idempotency state database
    pub db_file: PathBuf,

    /// Local directory where downloaded snapshots are cached
    pub snapshot_cache_dir: PathBuf,

    /// Scratch directory for snapshot builds
    pub work_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root: None,
            bucket: None,
            region: default_storage_region(),
            prefix: default_storage_prefix(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_index_m(),
            ef_construction: default_index_ef_construction(),
            ef_search: default_index_ef_search(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: default_query_k(),
            max_results: default_query_max_results(),
            cache_capacity: default_query_cache_capacity(),
            embed_timeout_ms: default_query_embed_timeout_ms(),
            keyword_weight: default_query_keyword_weight(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            target_min_bytes: default_compaction_target_min_bytes(),
            target_max_bytes: default_compaction_target_max_bytes(),
            max_files_per_batch: default_compaction_max_files_per_batch(),
            max_batches: default_compaction_max_batches(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_guard_ttl_secs(),
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_batcher_max_batch_size(),
            max_latency_ms: default_batcher_max_latency_ms(),
            backlog_cap: default_batcher_backlog_cap(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend_url: default_embedding_backend_url(),
            model: default_embedding_model(),
            image_model: default_embedding_image_model(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl PathsConfig {
    fn under(base: PathBuf) -> Self {
        Self {
            config_file: base.join("config.toml"),
            db_file: base.join("state.db"),
            snapshot_cache_dir: base.join("snapshots"),
            work_dir: base.join("work"),
            base_dir: base,
        }
    }
}

impl Config {
    /// Get the default base directory for mediagraph (~/.mediagraph)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mediagraph")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig::under(base);
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::under(base);
        config.paths.config_file = config_path.to_path_buf();

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_config_path())
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if mediagraph is initialized (config file exists)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists()
    }

    /// Root directory of the local storage backend
    pub fn local_store_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| self.paths.base_dir.join("store"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "local" | "memory" => {}
            "s3" => {
                if self.storage.bucket.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Config(
                        "storage.bucket is required for the s3 backend".to_string(),
                    ));
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "Unknown storage backend '{}'; expected local, memory or s3",
                    other
                )))
            }
        }

        if self.index.m < 2 {
            return Err(Error::Config("index.m must be >= 2".to_string()));
        }

        if self.index.ef_construction < self.index.m {
            return Err(Error::Config(
                "index.ef_construction must be >= index.m".to_string(),
            ));
        }

        if self.query.default_k == 0 || self.query.default_k > self.query.max_results {
            return Err(Error::Config(
                "query.default_k must be between 1 and query.max_results".to_string(),
            ));
        }

        if self.query.cache_capacity == 0 {
            return Err(Error::Config(
                "query.cache_capacity must be positive".to_string(),
            ));
        }

        if self.query.keyword_weight < 0.0 || self.query.keyword_weight > 1.0 {
            return Err(Error::Config(
                "query.keyword_weight must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.compaction.target_min_bytes > self.compaction.target_max_bytes {
            return Err(Error::Config(
                "compaction.target_min_bytes must be <= compaction.target_max_bytes".to_string(),
            ));
        }

        if self.compaction.max_files_per_batch < 2 {
            return Err(Error::Config(
                "compaction.max_files_per_batch must be >= 2".to_string(),
            ));
        }

        if self.batcher.max_batch_size == 0 || self.batcher.backlog_cap == 0 {
            return Err(Error::Config(
                "batcher.max_batch_size and batcher.backlog_cap must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
