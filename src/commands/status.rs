//! Status command implementation

use crate::config::Config;
use crate::error::Result;
use crate::guard::IdempotencyGuard;
use crate::manifest::{ConsistencyReport, ManifestOrigin, ManifestStore};
use crate::registry::Entity;
use crate::snapshot::{SnapshotLoader, SnapshotSidecar};
use crate::storage::Storage;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Live manifests of one entity
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityManifestStats {
    pub manifests: usize,
    pub compacted: usize,
    pub rows: u64,
    pub bytes: u64,
}

/// Status information
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub storage_backend: String,
    pub storage_prefix: String,
    pub embedding_backend: String,
    pub latest_snapshot: Option<SnapshotSidecar>,
    pub manifests: BTreeMap<String, EntityManifestStats>,
    pub consistency: ConsistencyReport,
    pub guard: BTreeMap<String, u64>,
}

/// Get system status
pub async fn cmd_status(config: &Config, storage: &Storage) -> Result<StatusInfo> {
    info!("Getting status");

    let loader = SnapshotLoader::new(storage.clone(), config.paths.snapshot_cache_dir.clone());
    let latest_snapshot = match loader.latest_pointer().await? {
        Some(pointer) => loader.sidecar(&pointer.snapshot_id).await?,
        None => None,
    };

    let store = ManifestStore::new(storage.clone());
    let mut manifests: BTreeMap<String, EntityManifestStats> = BTreeMap::new();
    for info in store.discover(None).await? {
        let stats = manifests.entry(info.entity.to_string()).or_default();
        stats.manifests += 1;
        if info.origin == ManifestOrigin::Compaction {
            stats.compacted += 1;
        }
        stats.rows += info.primary_rows();
        stats.bytes += info.total_bytes();
    }
    let consistency = store.check_consistency().await?;

    let guard = match IdempotencyGuard::connect(config).await {
        Ok(guard) => guard
            .counts()
            .await?
            .into_iter()
            .map(|(state, count)| (state.to_string(), count))
            .collect(),
        Err(e) => {
            debug!("Guard database unavailable: {}", e);
            BTreeMap::new()
        }
    };

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        storage_backend: config.storage.backend.clone(),
        storage_prefix: config.storage.prefix.clone(),
        embedding_backend: config.embedding.backend_url.clone(),
        latest_snapshot,
        manifests,
        consistency,
        guard,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 mediagraph Status\n");
    println!("Configuration: {}", status.config_path);
    println!("State database: {}", status.db_path);
    println!("\nStorage:");
    println!("  Backend: {}", status.storage_backend);
    println!("  Prefix: {}", status.storage_prefix);
    println!("\nEmbedding backend: {}", status.embedding_backend);

    println!("\nLatest snapshot:");
    match &status.latest_snapshot {
        Some(sidecar) => {
            println!("  ID: {}", sidecar.snapshot_id);
            println!("  Built: {} ({} ms)", sidecar.build_time, sidecar.duration_ms);
            println!("  Manifests: {}", sidecar.manifest_count);
            for (entity, rows) in &sidecar.row_counts_by_entity {
                println!("    {}: {} rows", entity, rows);
            }
        }
        None => println!("  none published (run 'mediagraph snapshot build')"),
    }

    println!("\nManifests:");
    if status.manifests.is_empty() {
        println!("  none");
    }
    for entity in Entity::ALL {
        if let Some(stats) = status.manifests.get(entity.as_str()) {
            println!(
                "  {}: {} manifests ({} compacted), {} rows, {} bytes",
                entity, stats.manifests, stats.compacted, stats.rows, stats.bytes
            );
        }
    }

    let consistency = if status.consistency.is_consistent() {
        "✓ Consistent"
    } else {
        "✗ Corrupt manifests present"
    };
    println!("\nConsistency: {}", consistency);
    println!("  Orphan files: {}", status.consistency.orphans.len());
    for uri in &status.consistency.corrupt {
        println!("  Corrupt: {}", uri);
    }

    if !status.guard.is_empty() {
        println!("\nIdempotency keys:");
        for (state, count) in &status.guard {
            println!("  {}: {}", state, count);
        }
    }
}
