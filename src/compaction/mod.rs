//! Compaction of small manifested outputs
//!
//! Each batch merges the part files of several manifests of one entity into
//! one new file per sub-table under a new manifest that supersedes them.
//! Sources are removed only once the replacement manifest is durable:
//! new files, then the new manifest, then the source manifests, then the
//! source files. A run that dies at any point leaves either orphaned
//! outputs or superseded inputs, both of which readers ignore.

mod audit;
mod policy;

pub use audit::*;
pub use policy::*;

use crate::config::CompactionConfig;
use crate::error::{Error, Result};
use crate::manifest::{ManifestFile, ManifestInfo, ManifestMeta, ManifestOrigin, ManifestStore};
use crate::storage::Storage;
use crate::table::{concat, conform_batch};
use crate::writer::{ColumnarWriter, Destination};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOptions {
    /// Plan and report only; no data is written or deleted
    pub dry_run: bool,
    /// Abort a batch on any row-count mismatch
    pub strict: bool,
    /// Leave out manifests with missing sub-tables or files (ignored when strict)
    pub skip_missing: bool,
    /// Write outputs with every column declared nullable
    pub relax_nulls: bool,
}

#[derive(Debug, Clone)]
pub struct CompactionPlan {
    /// Live manifests newer than the watermark, oldest first
    pub considered: Vec<ManifestInfo>,
    pub batches: Vec<PlannedBatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub considered: usize,
    pub dry_run: bool,
    pub watermark: Option<DateTime<Utc>>,
    pub batches: Vec<AuditRecord>,
    pub duration_ms: u64,
}

impl CompactionReport {
    pub fn completed(&self) -> usize {
        self.count(BatchStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(BatchStatus::Failed)
    }

    fn count(&self, status: BatchStatus) -> usize {
        self.batches.iter().filter(|b| b.status == status).count()
    }
}

pub struct CompactionEngine {
    storage: Storage,
    writer: ColumnarWriter,
    manifests: ManifestStore,
    policy: CompactionPolicy,
}

impl CompactionEngine {
    pub fn new(storage: Storage, config: &CompactionConfig) -> Self {
        Self::with_policy(storage, CompactionPolicy::from(config))
    }

    pub fn with_policy(storage: Storage, policy: CompactionPolicy) -> Self {
        Self {
            writer: ColumnarWriter::new(storage.clone()),
            manifests: ManifestStore::new(storage.clone()),
            storage,
            policy,
        }
    }

    /// Plan batches over the live manifests newer than the watermark
    pub async fn plan(&self) -> Result<CompactionPlan> {
        let state = CompactionState::load(&self.storage).await?;
        let manifests = self.manifests.discover(state.watermark).await?;
        let batches = plan_batches(&manifests, &self.policy);
        Ok(CompactionPlan {
            considered: manifests,
            batches,
        })
    }

    /// Plan and execute one compaction run.
    ///
    /// A failing batch is recorded in its audit record and the run moves on
    /// to the next batch; only storage errors on state or audit writes fail
    /// the whole run. The watermark only moves past manifests that were
    /// merged by a completed batch or are already large enough, so small
    /// leftovers and inputs of failed batches are planned again next time.
    pub async fn run(&self, options: CompactionOptions) -> Result<CompactionReport> {
        let started = Instant::now();
        let plan = self.plan().await?;
        info!(
            considered = plan.considered.len(),
            batches = plan.batches.len(),
            dry_run = options.dry_run,
            strict = options.strict,
            "Compaction planned"
        );

        let mut merged: HashSet<String> = HashSet::new();
        let mut records = Vec::with_capacity(plan.batches.len());
        for batch in &plan.batches {
            let record = if options.dry_run {
                self.describe(batch, options)
            } else {
                let record = self.compact(batch, options).await;
                if record.status == BatchStatus::Completed {
                    merged.extend(record.manifests.iter().cloned());
                }
                record
            };
            write_audit(&self.storage, &record).await?;
            records.push(record);
        }

        let mut state = CompactionState::load(&self.storage).await?;
        if !options.dry_run {
            let settled = settled_watermark(&plan.considered, &merged, &self.policy);
            debug!(watermark = ?settled, merged = merged.len(), "Advancing compaction watermark");
            state.advance(settled);
            state.save(&self.storage).await?;
        }

        let report = CompactionReport {
            considered: plan.considered.len(),
            dry_run: options.dry_run,
            watermark: state.watermark,
            batches: records,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            completed = report.completed(),
            failed = report.failed(),
            duration_ms = report.duration_ms,
            "Compaction finished"
        );
        Ok(report)
    }

    fn describe(&self, batch: &PlannedBatch, options: CompactionOptions) -> AuditRecord {
        let mut record = AuditRecord::new(
            &batch.batch_id,
            batch.entity,
            batch.schema_version,
            true,
            options.strict,
        );
        for manifest in &batch.manifests {
            record.manifests.push(manifest.run_id.clone());
            for file in &manifest.files {
                record.record_input(AuditFile {
                    kind: file.kind,
                    uri: file.uri.clone(),
                    rows: file.row_count,
                    bytes: file.bytes,
                });
            }
        }
        record
    }

    /// Execute one batch and return its audit record
    async fn compact(&self, batch: &PlannedBatch, options: CompactionOptions) -> AuditRecord {
        let started = Instant::now();
        let mut record = AuditRecord::new(
            &batch.batch_id,
            batch.entity,
            batch.schema_version,
            false,
            options.strict,
        );

        match self.merge(batch, options, &mut record).await {
            Ok(manifest) => {
                record.status = BatchStatus::Completed;
                record.output_manifest = Some(manifest.uri());
            }
            Err(e) => {
                warn!(batch = %batch.batch_id, entity = %batch.entity, error = %e, "Compaction batch failed");
                record.status = BatchStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        record.duration_ms = started.elapsed().as_millis() as u64;
        record
    }

    async fn usable(&self, manifest: &ManifestInfo) -> Result<()> {
        if let Some(kind) = manifest.missing_kinds().first() {
            return Err(Error::MissingSubTable {
                entity: manifest.entity.to_string(),
                kind: kind.to_string(),
                run_id: manifest.run_id.clone(),
            });
        }
        let missing = self.manifests.check_files_exist(manifest).await?;
        if !missing.is_empty() {
            return Err(Error::CorruptManifest {
                manifest: manifest.uri(),
                reason: format!("missing files: {}", missing.join(", ")),
            });
        }
        Ok(())
    }

    async fn merge(
        &self,
        batch: &PlannedBatch,
        options: CompactionOptions,
        record: &mut AuditRecord,
    ) -> Result<ManifestInfo> {
        let entity = batch.entity;

        let mut inputs: Vec<&ManifestInfo> = Vec::new();
        for manifest in &batch.manifests {
            match self.usable(manifest).await {
                Ok(()) => inputs.push(manifest),
                Err(e) if options.skip_missing && !options.strict => {
                    warn!(manifest = %manifest.uri(), error = %e, "Skipping partial manifest");
                }
                Err(e) => return Err(e),
            }
        }
        record.manifests = inputs.iter().map(|m| m.run_id.clone()).collect();
        if inputs.len() < 2 {
            return Err(Error::IncompleteEntity {
                entity: entity.to_string(),
                reason: format!("only {} usable manifest(s) left to merge", inputs.len()),
            });
        }

        let mut written: Vec<ManifestFile> = Vec::new();
        let result = self
            .write_outputs(batch, &inputs, options, record, &mut written)
            .await;
        let manifest = match result {
            Ok(()) => {
                let pipeline_version = inputs
                    .last()
                    .map(|m| m.pipeline_version.clone())
                    .unwrap_or_default();
                let manifest = ManifestInfo::build(
                    written.clone(),
                    ManifestMeta {
                        entity,
                        schema_version: batch.schema_version,
                        pipeline_version,
                        origin: ManifestOrigin::Compaction,
                        supersedes: inputs.iter().map(|m| m.run_id.clone()).collect(),
                    },
                );
                self.manifests.write(&manifest).await.map(|_| manifest)
            }
            Err(e) => Err(e),
        };
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                // Unreferenced outputs would only be orphans, but nothing
                // points at them so drop them now
                for file in &written {
                    if let Err(cleanup) = self.storage.delete(&file.uri).await {
                        debug!(uri = %file.uri, error = %cleanup, "Could not remove partial output");
                    }
                }
                return Err(e);
            }
        };

        for source in &inputs {
            if let Err(e) = self.manifests.delete(source).await {
                warn!(manifest = %source.uri(), error = %e, "Could not delete superseded manifest");
            }
        }
        for source in &inputs {
            for file in &source.files {
                if let Err(e) = self.storage.delete(&file.uri).await {
                    warn!(uri = %file.uri, error = %e, "Could not delete compacted file");
                }
            }
        }

        info!(
            entity = %entity,
            manifests = inputs.len(),
            rows = record.rows_out,
            bytes_in = record.bytes_in,
            bytes_out = record.bytes_out,
            "Compacted batch"
        );
        Ok(manifest)
    }

    async fn write_outputs(
        &self,
        batch: &PlannedBatch,
        inputs: &[&ManifestInfo],
        options: CompactionOptions,
        record: &mut AuditRecord,
        written: &mut Vec<ManifestFile>,
    ) -> Result<()> {
        let entity = batch.entity;
        let mut primary_rows: Option<u64> = None;

        for kind in entity.required_kinds() {
            let dest = Destination {
                entity,
                kind: *kind,
                schema_version: batch.schema_version,
                relax_nulls: options.relax_nulls,
            };
            let schema = dest.schema()?.to_arrow();

            let mut parts = Vec::new();
            let mut rows_read = 0u64;
            for manifest in inputs {
                for file in manifest.files_of(*kind) {
                    let part = self.writer.read(&file.uri).await?;
                    let rows = part.batch.num_rows() as u64;
                    if rows != file.row_count {
                        let mismatch = Error::RowCountMismatch {
                            entity: entity.to_string(),
                            kind: kind.to_string(),
                            expected: file.row_count,
                            actual: rows,
                        };
                        if options.strict {
                            return Err(mismatch);
                        }
                        warn!(uri = %file.uri, error = %mismatch, "Row count differs from manifest");
                    }
                    record.record_input(AuditFile {
                        kind: *kind,
                        uri: file.uri.clone(),
                        rows,
                        bytes: file.bytes,
                    });
                    rows_read += rows;
                    parts.push(conform_batch(&part.batch, &schema)?);
                }
            }

            if options.strict {
                match primary_rows {
                    Some(expected) if expected != rows_read => {
                        return Err(Error::RowCountMismatch {
                            entity: entity.to_string(),
                            kind: kind.to_string(),
                            expected,
                            actual: rows_read,
                        });
                    }
                    _ => primary_rows = Some(rows_read),
                }
            }

            let merged = concat(&schema, &parts)?;
            let result = self.writer.write(&merged, dest).await?;
            if result.row_count != rows_read {
                return Err(Error::RowCountMismatch {
                    entity: entity.to_string(),
                    kind: kind.to_string(),
                    expected: rows_read,
                    actual: result.row_count,
                });
            }
            record.record_output(AuditFile {
                kind: *kind,
                uri: result.uri.clone(),
                rows: result.row_count,
                bytes: result.bytes,
            });
            written.push(ManifestFile::from_write(*kind, &result));
        }
        Ok(())
    }
}
