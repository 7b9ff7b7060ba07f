//! Compact command implementation

use crate::compaction::{BatchStatus, CompactionEngine, CompactionOptions, CompactionReport};
use crate::config::Config;
use crate::error::Result;
use crate::storage::Storage;
use tracing::info;

/// Run one compaction pass
pub async fn cmd_compact(
    config: &Config,
    storage: &Storage,
    options: CompactionOptions,
) -> Result<CompactionReport> {
    info!(
        dry_run = options.dry_run,
        strict = options.strict,
        skip_missing = options.skip_missing,
        relax_nulls = options.relax_nulls,
        "Starting compaction"
    );
    CompactionEngine::new(storage.clone(), &config.compaction)
        .run(options)
        .await
}

pub fn print_compaction_report(report: &CompactionReport) {
    if report.dry_run {
        println!("\n🧹 Compaction plan (dry run)\n");
    } else {
        println!("\n🧹 Compaction complete\n");
    }
    println!("  Manifests considered: {}", report.considered);
    println!("  Batches: {}", report.batches.len());
    if !report.dry_run {
        println!("  Completed: {}", report.completed());
        println!("  Failed: {}", report.failed());
    }
    if let Some(watermark) = report.watermark {
        println!("  Watermark: {}", watermark);
    }
    println!("  Duration: {} ms", report.duration_ms);

    for batch in &report.batches {
        let status = match batch.status {
            BatchStatus::Planned => "planned",
            BatchStatus::Completed => "✓",
            BatchStatus::Failed => "✗",
        };
        println!(
            "\n  {} {} v{} [{}]",
            status, batch.entity, batch.schema_version, batch.batch_id
        );
        println!(
            "    {} manifests, rows {} -> {}, bytes {} -> {}",
            batch.manifests.len(),
            batch.rows_in,
            batch.rows_out,
            batch.bytes_in,
            batch.bytes_out
        );
        if let Some(error) = &batch.error {
            println!("    Error: {}", error);
        }
    }
}
