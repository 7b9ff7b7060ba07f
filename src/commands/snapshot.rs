//! Snapshot build command

use crate::config::Config;
use crate::error::Result;
use crate::snapshot::{AnnParams, SnapshotBuilder, SnapshotSidecar};
use crate::storage::Storage;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub progress: bool,
}

/// Build and publish a snapshot from the live manifests
pub async fn cmd_snapshot_build(
    config: &Config,
    storage: &Storage,
    options: SnapshotOptions,
) -> Result<SnapshotSidecar> {
    std::fs::create_dir_all(&config.paths.work_dir)?;

    let builder = SnapshotBuilder::new(
        storage.clone(),
        AnnParams::from(&config.index),
        config.paths.work_dir.clone(),
    )
    .with_progress(options.progress);

    let outcome = builder.build().await?;
    info!(
        snapshot_id = %outcome.sidecar.snapshot_id,
        db = ?outcome.db_path,
        "Snapshot published"
    );
    Ok(outcome.sidecar)
}

pub fn print_snapshot(sidecar: &SnapshotSidecar) {
    println!("\n✓ Snapshot {} published", sidecar.snapshot_id);
    println!("  Manifests: {}", sidecar.manifest_count);
    println!("  Duration: {} ms", sidecar.duration_ms);
    if let Some(watermark) = sidecar.watermark {
        println!("  Watermark: {}", watermark);
    }
    println!("\nRows:");
    for (entity, rows) in &sidecar.row_counts_by_entity {
        println!("  {}: {}", entity, rows);
    }
    if !sidecar.index_sizes.is_empty() {
        println!("\nIndexes:");
        for (entity, size) in &sidecar.index_sizes {
            println!(
                "  {}.{}: {} points, dim {}, ~{} bytes (m={}, ef_construction={})",
                entity,
                size.column,
                size.points,
                size.dimension,
                size.approx_bytes,
                size.m,
                size.ef_construction
            );
        }
    }
}
