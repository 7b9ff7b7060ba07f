//! Greedy batch planning

use crate::config::CompactionConfig;
use crate::manifest::ManifestInfo;
use crate::registry::Entity;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub target_min_bytes: u64,
    pub target_max_bytes: u64,
    pub max_files_per_batch: usize,
    pub max_batches: usize,
}

impl From<&CompactionConfig> for CompactionPolicy {
    fn from(config: &CompactionConfig) -> Self {
        Self {
            target_min_bytes: config.target_min_bytes,
            target_max_bytes: config.target_max_bytes,
            max_files_per_batch: config.max_files_per_batch,
            max_batches: config.max_batches,
        }
    }
}

/// Manifests of one entity that will be merged together
#[derive(Debug, Clone)]
pub struct PlannedBatch {
    pub batch_id: String,
    pub entity: Entity,
    /// Output version: the newest version among the inputs
    pub schema_version: u32,
    pub manifests: Vec<ManifestInfo>,
}

impl PlannedBatch {
    fn new(entity: Entity, manifests: Vec<ManifestInfo>) -> Self {
        let schema_version = manifests
            .iter()
            .map(|m| m.schema_version)
            .max()
            .unwrap_or(1);
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            entity,
            schema_version,
            manifests,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.manifests.iter().map(|m| m.total_bytes()).sum()
    }

    pub fn file_count(&self) -> usize {
        self.manifests.iter().map(|m| m.files.len()).sum()
    }
}

struct Accumulator<'a> {
    manifests: Vec<&'a ManifestInfo>,
    bytes: u64,
    files: usize,
}

impl<'a> Accumulator<'a> {
    fn new() -> Self {
        Self {
            manifests: Vec::new(),
            bytes: 0,
            files: 0,
        }
    }

    fn push(&mut self, manifest: &'a ManifestInfo) {
        self.bytes += manifest.total_bytes();
        self.files += manifest.files.len();
        self.manifests.push(manifest);
    }

    /// Emit the accumulated manifests as a batch; a lone manifest has
    /// nothing to merge with and is dropped
    fn close(&mut self, entity: Entity, out: &mut Vec<PlannedBatch>) {
        let taken = std::mem::replace(self, Self::new());
        if taken.manifests.len() >= 2 {
            out.push(PlannedBatch::new(
                entity,
                taken.manifests.into_iter().cloned().collect(),
            ));
        }
    }
}

/// Plan batches over `manifests` (in arrival order).
///
/// Per entity, manifests are accumulated in order until the batch reaches
/// `target_min_bytes`; a manifest that would push it past
/// `target_max_bytes` or `max_files_per_batch` starts a new batch.
/// Manifests already at least `target_min_bytes` on their own are left
/// alone. Planning stops after `max_batches`.
pub fn plan_batches(manifests: &[ManifestInfo], policy: &CompactionPolicy) -> Vec<PlannedBatch> {
    let mut batches = Vec::new();

    for entity in Entity::ALL {
        let mut acc = Accumulator::new();
        for manifest in manifests.iter().filter(|m| m.entity == entity) {
            if batches.len() >= policy.max_batches {
                return batches;
            }
            let bytes = manifest.total_bytes();
            if bytes >= policy.target_min_bytes {
                continue;
            }
            let overflow = acc.bytes + bytes > policy.target_max_bytes
                || acc.files + manifest.files.len() > policy.max_files_per_batch;
            if !acc.manifests.is_empty() && overflow {
                acc.close(entity, &mut batches);
                if batches.len() >= policy.max_batches {
                    return batches;
                }
            }
            acc.push(manifest);
            if acc.bytes >= policy.target_min_bytes {
                acc.close(entity, &mut batches);
            }
        }
        if batches.len() < policy.max_batches {
            acc.close(entity, &mut batches);
        }
    }

    batches.truncate(policy.max_batches);
    batches
}

/// Newest timestamp the watermark may move to after a run.
///
/// `considered` is in arrival order. A manifest is settled once a completed
/// batch merged it (its run id is in `merged`) or it is at least
/// `target_min_bytes` on its own. The watermark stays strictly below the
/// oldest unsettled manifest so that manifest is discovered again.
pub fn settled_watermark(
    considered: &[ManifestInfo],
    merged: &HashSet<String>,
    policy: &CompactionPolicy,
) -> Option<DateTime<Utc>> {
    let floor = considered
        .iter()
        .filter(|m| !merged.contains(&m.run_id) && m.total_bytes() < policy.target_min_bytes)
        .map(|m| m.created_at)
        .min();
    considered
        .iter()
        .map(|m| m.created_at)
        .filter(|t| floor.map_or(true, |f| *t < f))
        .max()
}
