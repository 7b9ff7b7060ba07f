//! Run manifests
//!
//! A manifest is the provenance record of one ingestion or compaction run:
//! every part file it produced with row count, size and checksum. Manifests
//! are immutable and are written only after all the files they reference are
//! durable, so a reader that finds a manifest can rely on its files.

use crate::error::{Error, Result};
use crate::registry::{self, Entity, FileKind};
use crate::storage::Storage;
use crate::writer::{checksum, decode_parquet, WriteResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Which kind of run produced a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestOrigin {
    Ingest,
    Compaction,
}

/// One output file of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub kind: FileKind,
    pub uri: String,
    pub row_count: u64,
    pub bytes: u64,
    pub checksum: String,
}

impl ManifestFile {
    pub fn from_write(kind: FileKind, result: &WriteResult) -> Self {
        Self {
            kind,
            uri: result.uri.clone(),
            row_count: result.row_count,
            bytes: result.bytes,
            checksum: result.checksum.clone(),
        }
    }
}

/// Provenance record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub run_id: String,
    pub entity: Entity,
    pub schema_version: u32,
    pub pipeline_version: String,
    pub created_at: DateTime<Utc>,
    pub origin: ManifestOrigin,
    /// Run ids this manifest replaces (compaction only)
    #[serde(default)]
    pub supersedes: Vec<String>,
    pub files: Vec<ManifestFile>,
}

/// Metadata supplied when building a manifest
#[derive(Debug, Clone)]
pub struct ManifestMeta {
    pub entity: Entity,
    pub schema_version: u32,
    pub pipeline_version: String,
    pub origin: ManifestOrigin,
    pub supersedes: Vec<String>,
}

impl ManifestMeta {
    pub fn ingest(entity: Entity, schema_version: u32, pipeline_version: &str) -> Self {
        Self {
            entity,
            schema_version,
            pipeline_version: pipeline_version.to_string(),
            origin: ManifestOrigin::Ingest,
            supersedes: Vec::new(),
        }
    }
}

impl ManifestInfo {
    /// Assemble a manifest for freshly written files
    pub fn build(files: Vec<ManifestFile>, meta: ManifestMeta) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            entity: meta.entity,
            schema_version: meta.schema_version,
            pipeline_version: meta.pipeline_version,
            created_at: Utc::now(),
            origin: meta.origin,
            supersedes: meta.supersedes,
            files,
        }
    }

    pub fn uri(&self) -> String {
        registry::manifest_path(self.entity, &self.run_id)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }

    /// Row count of the core (or adjacency) sub-table
    pub fn primary_rows(&self) -> u64 {
        self.files
            .iter()
            .find(|f| matches!(f.kind, FileKind::Core | FileKind::AdjList))
            .map(|f| f.row_count)
            .unwrap_or(0)
    }

    pub fn files_of(&self, kind: FileKind) -> impl Iterator<Item = &ManifestFile> {
        self.files.iter().filter(move |f| f.kind == kind)
    }

    /// Sub-tables the entity requires that this manifest does not list
    pub fn missing_kinds(&self) -> Vec<FileKind> {
        self.entity
            .required_kinds()
            .iter()
            .copied()
            .filter(|kind| self.files_of(*kind).next().is_none())
            .collect()
    }
}

/// Result of [`ManifestStore::check_consistency`]
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsistencyReport {
    pub manifests: usize,
    pub referenced_files: usize,
    /// Part files no manifest references; safe to garbage collect
    pub orphans: Vec<String>,
    /// Manifests whose referenced files are missing or unreadable
    pub corrupt: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Reads and writes manifests in object storage
#[derive(Debug, Clone)]
pub struct ManifestStore {
    storage: Storage,
}

impl ManifestStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Persist a manifest. Callers must have written every referenced file.
    pub async fn write(&self, info: &ManifestInfo) -> Result<String> {
        let uri = info.uri();
        let body = serde_json::to_vec_pretty(info)?;
        self.storage.put(&uri, Bytes::from(body)).await?;
        info!(
            entity = %info.entity,
            run_id = %info.run_id,
            files = info.files.len(),
            "Committed manifest"
        );
        Ok(uri)
    }

    /// Read a manifest; a manifest that does not exist yet is `None`
    pub async fn read(&self, uri: &str) -> Result<Option<ManifestInfo>> {
        let Some(data) = self.storage.get_opt(uri).await? else {
            return Ok(None);
        };
        let info = serde_json::from_slice(&data).map_err(|e| Error::CorruptManifest {
            manifest: uri.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(info))
    }

    /// Confirm every referenced file exists and matches its recorded row
    /// count, size and checksum
    pub async fn verify(&self, info: &ManifestInfo) -> Result<()> {
        let corrupt = |reason: String| Error::CorruptManifest {
            manifest: info.uri(),
            reason,
        };

        for file in &info.files {
            let Some(data) = self.storage.get_opt(&file.uri).await? else {
                return Err(corrupt(format!("referenced file {} is missing", file.uri)));
            };
            if data.len() as u64 != file.bytes {
                return Err(corrupt(format!(
                    "{} is {} bytes, manifest records {}",
                    file.uri,
                    data.len(),
                    file.bytes
                )));
            }
            let actual = checksum(&data);
            if actual != file.checksum {
                return Err(corrupt(format!("{} checksum mismatch", file.uri)));
            }
            let part = decode_parquet(&file.uri, data)?;
            if part.batch.num_rows() as u64 != file.row_count {
                return Err(corrupt(format!(
                    "{} has {} rows, manifest records {}",
                    file.uri,
                    part.batch.num_rows(),
                    file.row_count
                )));
            }
        }
        Ok(())
    }

    /// Cheap check that every referenced file is present
    pub async fn check_files_exist(&self, info: &ManifestInfo) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for file in &info.files {
            if !self.storage.exists(&file.uri).await? {
                missing.push(file.uri.clone());
            }
        }
        Ok(missing)
    }

    /// All manifests including superseded ones, sorted by (created_at, run_id)
    pub async fn list_all(&self, entity: Option<Entity>) -> Result<Vec<ManifestInfo>> {
        let prefix = match entity {
            Some(e) => registry::manifest_dir(e),
            None => registry::MANIFESTS_ROOT.to_string(),
        };

        let mut manifests = Vec::new();
        for object in self.storage.list(&prefix).await? {
            if !object.key.ends_with(".json") {
                continue;
            }
            // Deleted between list and read by a concurrent compaction
            if let Some(info) = self.read(&object.key).await? {
                manifests.push(info);
            }
        }
        manifests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(manifests)
    }

    /// Live manifests created after `since`, sorted by (created_at, run_id).
    ///
    /// Manifests replaced by a compaction manifest are dropped even if their
    /// files have not been deleted yet.
    pub async fn discover(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ManifestInfo>> {
        let all = self.list_all(None).await?;
        let superseded: HashSet<&str> = all
            .iter()
            .flat_map(|m| m.supersedes.iter().map(String::as_str))
            .collect();

        let live: Vec<ManifestInfo> = all
            .iter()
            .filter(|m| !superseded.contains(m.run_id.as_str()))
            .filter(|m| since.map(|s| m.created_at > s).unwrap_or(true))
            .cloned()
            .collect();

        debug!(
            total = all.len(),
            live = live.len(),
            superseded = superseded.len(),
            "Discovered manifests"
        );
        Ok(live)
    }

    pub async fn delete(&self, info: &ManifestInfo) -> Result<()> {
        self.storage.delete(&info.uri()).await
    }

    /// Cross-check part files against manifests.
    ///
    /// Unreferenced part files are reported as orphans, not errors; manifests
    /// whose files are missing are reported as corrupt.
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let manifests = self.list_all(None).await?;
        let mut report = ConsistencyReport {
            manifests: manifests.len(),
            ..Default::default()
        };

        let mut referenced: HashSet<String> = HashSet::new();
        for manifest in &manifests {
            let missing = self.check_files_exist(manifest).await?;
            if !missing.is_empty() {
                warn!(
                    manifest = %manifest.uri(),
                    missing = missing.len(),
                    "Manifest references missing files"
                );
                report.corrupt.push(manifest.uri());
            }
            referenced.extend(manifest.files.iter().map(|f| f.uri.clone()));
        }
        report.referenced_files = referenced.len();

        for root in [registry::VERTICES_ROOT, registry::EDGES_ROOT] {
            for object in self.storage.list(root).await? {
                if registry::parse_part_path(&object.key).is_some()
                    && !referenced.contains(&object.key)
                {
                    report.orphans.push(object.key);
                }
            }
        }

        if !report.orphans.is_empty() {
            info!(orphans = report.orphans.len(), "Found unreferenced part files");
        }
        Ok(report)
    }
}

/// Group manifests by (entity, schema_version), keeping their order
pub fn group_by_version(
    manifests: &[ManifestInfo],
) -> BTreeMap<(Entity, u32), Vec<&ManifestInfo>> {
    let mut groups: BTreeMap<(Entity, u32), Vec<&ManifestInfo>> = BTreeMap::new();
    for manifest in manifests {
        groups
            .entry((manifest.entity, manifest.schema_version))
            .or_default()
            .push(manifest);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{row, Value};
    use crate::writer::{ColumnarWriter, Destination};

    async fn write_text_manifest(
        storage: &Storage,
        ids: &[&str],
    ) -> (ManifestStore, ManifestInfo) {
        let writer = ColumnarWriter::new(storage.clone());
        let rows: Vec<_> = ids
            .iter()
            .map(|id| {
                row([
                    ("id", Value::from(*id)),
                    ("schema_version", Value::Int(1)),
                    ("text", Value::from("hello")),
                ])
            })
            .collect();
        let result = writer
            .write_rows(&rows, Destination::new(Entity::DocChunk, FileKind::Text, 1))
            .await
            .unwrap();
        let info = ManifestInfo::build(
            vec![ManifestFile::from_write(FileKind::Text, &result)],
            ManifestMeta::ingest(Entity::DocChunk, 1, "test-0.1"),
        );
        let store = ManifestStore::new(storage.clone());
        store.write(&info).await.unwrap();
        (store, info)
    }

    #[tokio::test]
    async fn test_read_back_matches_recorded_counts() {
        let storage = Storage::in_memory("v1");
        let (store, info) = write_text_manifest(&storage, &["a", "b", "c"]).await;

        let loaded = store.read(&info.uri()).await.unwrap().unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.files[0].row_count, 3);
        store.verify(&loaded).await.unwrap();
    }

    #[tokio::test]
    async fn test_absent_manifest_is_not_an_error() {
        let store = ManifestStore::new(Storage::in_memory("v1"));
        let missing = registry::manifest_path(Entity::DocChunk, "not-yet");
        assert!(store.read(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_corruption() {
        let storage = Storage::in_memory("v1");
        let (store, info) = write_text_manifest(&storage, &["a"]).await;
        storage.delete(&info.files[0].uri).await.unwrap();

        let err = store.verify(&info).await.unwrap_err();
        assert!(matches!(err, Error::CorruptManifest { .. }));
        assert!(!err.is_retryable());

        let report = store.check_consistency().await.unwrap();
        assert_eq!(report.corrupt, vec![info.uri()]);
    }

    #[tokio::test]
    async fn test_tampered_file_fails_verify() {
        let storage = Storage::in_memory("v1");
        let (store, info) = write_text_manifest(&storage, &["a"]).await;
        let mut tampered = info.clone();
        tampered.files[0].checksum = checksum(b"something else");
        assert!(store.verify(&tampered).await.is_err());
    }

    #[tokio::test]
    async fn test_orphan_is_reported_not_corrupt() {
        let storage = Storage::in_memory("v1");
        let (store, _info) = write_text_manifest(&storage, &["a"]).await;

        // a writer that died before committing its manifest
        let writer = ColumnarWriter::new(storage.clone());
        let orphan = writer
            .write_rows(
                &[row([
                    ("id", Value::from("z")),
                    ("schema_version", Value::Int(1)),
                    ("text", Value::from("lost")),
                ])],
                Destination::new(Entity::DocChunk, FileKind::Text, 1),
            )
            .await
            .unwrap();

        let report = store.check_consistency().await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.orphans, vec![orphan.uri]);
        assert_eq!(store.discover(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discover_drops_superseded_and_old() {
        let storage = Storage::in_memory("v1");
        let (store, first) = write_text_manifest(&storage, &["a"]).await;
        let (_, second) = write_text_manifest(&storage, &["b"]).await;

        let compacted = ManifestInfo::build(
            first.files.clone(),
            ManifestMeta {
                origin: ManifestOrigin::Compaction,
                supersedes: vec![first.run_id.clone()],
                ..ManifestMeta::ingest(Entity::DocChunk, 1, "test-0.1")
            },
        );
        store.write(&compacted).await.unwrap();

        let live = store.discover(None).await.unwrap();
        let ids: Vec<&str> = live.iter().map(|m| m.run_id.as_str()).collect();
        assert!(!ids.contains(&first.run_id.as_str()));
        assert!(ids.contains(&second.run_id.as_str()));
        assert!(ids.contains(&compacted.run_id.as_str()));

        let newer = store.discover(Some(second.created_at)).await.unwrap();
        assert!(newer.iter().all(|m| m.created_at > second.created_at));
    }
}
