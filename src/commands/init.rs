//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::guard::IdempotencyGuard;
use crate::storage::Storage;
use std::path::PathBuf;
use tracing::info;

/// Write a default configuration and create local state.
///
/// Creates the config file, the snapshot cache and work directories, the
/// local store root (for the local backend) and the idempotency database.
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<Config> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    if config.is_initialized() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config.paths.config_file.display()
        )));
    }

    config.validate()?;
    config.save()?;

    std::fs::create_dir_all(&config.paths.snapshot_cache_dir)?;
    std::fs::create_dir_all(&config.paths.work_dir)?;
    if config.storage.backend == "local" {
        std::fs::create_dir_all(config.local_store_root())?;
    }
    Storage::from_config(&config)?;

    IdempotencyGuard::connect(&config).await?;
    info!("Created state database at {:?}", config.paths.db_file);

    Ok(config)
}
