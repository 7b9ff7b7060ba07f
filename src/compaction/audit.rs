//! Audit records and watermark state

use crate::error::Result;
use crate::registry::{self, Entity, FileKind};
use crate::storage::Storage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Dry run: planned only
    Planned,
    Completed,
    Failed,
}

/// A file read or written by a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFile {
    pub kind: FileKind,
    pub uri: String,
    pub rows: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub rows_in: u64,
    pub rows_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub batch_id: String,
    pub entity: Entity,
    pub schema_version: u32,
    /// Run ids of the merged manifests
    pub manifests: Vec<String>,
    pub inputs: Vec<AuditFile>,
    pub outputs: Vec<AuditFile>,
    pub per_kind: BTreeMap<FileKind, KindCounts>,
    pub rows_in: u64,
    pub rows_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub dry_run: bool,
    pub strict: bool,
    pub duration_ms: u64,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_manifest: Option<String>,
}

impl AuditRecord {
    pub fn new(batch_id: &str, entity: Entity, schema_version: u32, dry_run: bool, strict: bool) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            entity,
            schema_version,
            manifests: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            per_kind: BTreeMap::new(),
            rows_in: 0,
            rows_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            dry_run,
            strict,
            duration_ms: 0,
            status: BatchStatus::Planned,
            error: None,
            output_manifest: None,
        }
    }

    pub fn record_input(&mut self, file: AuditFile) {
        let counts = self.per_kind.entry(file.kind).or_default();
        counts.rows_in += file.rows;
        counts.bytes_in += file.bytes;
        if matches!(file.kind, FileKind::Core | FileKind::AdjList) {
            self.rows_in += file.rows;
        }
        self.bytes_in += file.bytes;
        self.inputs.push(file);
    }

    pub fn record_output(&mut self, file: AuditFile) {
        let counts = self.per_kind.entry(file.kind).or_default();
        counts.rows_out += file.rows;
        counts.bytes_out += file.bytes;
        if matches!(file.kind, FileKind::Core | FileKind::AdjList) {
            self.rows_out += file.rows;
        }
        self.bytes_out += file.bytes;
        self.outputs.push(file);
    }

    pub fn uri(&self) -> String {
        registry::compaction_audit_path(&self.batch_id)
    }
}

pub async fn write_audit(storage: &Storage, record: &AuditRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    storage.put(&record.uri(), Bytes::from(json)).await
}

pub async fn read_audit(storage: &Storage, batch_id: &str) -> Result<Option<AuditRecord>> {
    match storage.get_opt(&registry::compaction_audit_path(batch_id)).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Persistent compaction progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionState {
    /// Newest manifest timestamp already considered
    pub watermark: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: u64,
}

impl CompactionState {
    pub async fn load(storage: &Storage) -> Result<Self> {
        match storage.get_opt(registry::COMPACTION_STATE).await? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, storage: &Storage) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        storage
            .put(registry::COMPACTION_STATE, Bytes::from(json))
            .await
    }

    pub fn advance(&mut self, seen: Option<DateTime<Utc>>) {
        self.watermark = self.watermark.max(seen);
        self.last_run = Some(Utc::now());
        self.runs += 1;
    }
}
