//! Canonical object layout, relative to the storage root prefix

use super::{Entity, FileKind};
use crate::error::{Error, Result};
use uuid::Uuid;

/// Pointer to the most recently published snapshot
pub const LATEST_SNAPSHOT_POINTER: &str = "snapshots/LATEST.json";

/// Compaction watermark state
pub const COMPACTION_STATE: &str = "_compaction/state.json";

pub const MANIFESTS_ROOT: &str = "manifests";
pub const SNAPSHOTS_ROOT: &str = "snapshots";
pub const VERTICES_ROOT: &str = "vertices";
pub const EDGES_ROOT: &str = "edges";

/// Directory holding every part file of `entity`/`kind`
pub fn part_dir(entity: Entity, kind: FileKind) -> Result<String> {
    if !entity.has_kind(kind) {
        return Err(Error::Schema(format!(
            "{} has no {} sub-table",
            entity, kind
        )));
    }
    let root = if entity.is_edge() {
        EDGES_ROOT
    } else {
        VERTICES_ROOT
    };
    Ok(format!("{}/{}/{}", root, entity.as_str(), kind.as_str()))
}

/// Canonical location of one part file
pub fn path_for(entity: Entity, kind: FileKind, part_id: &Uuid) -> Result<String> {
    Ok(format!("{}/part-{}.parquet", part_dir(entity, kind)?, part_id))
}

/// Recover entity and kind from a part file location
pub fn parse_part_path(path: &str) -> Option<(Entity, FileKind)> {
    let mut segments = path.split('/');
    let root = segments.next()?;
    let entity: Entity = segments.next()?.parse().ok()?;
    let kind: FileKind = segments.next()?.parse().ok()?;
    let file = segments.next()?;
    if segments.next().is_some() || !file.starts_with("part-") || !file.ends_with(".parquet") {
        return None;
    }
    let expected_root = if entity.is_edge() {
        EDGES_ROOT
    } else {
        VERTICES_ROOT
    };
    (root == expected_root && entity.has_kind(kind)).then_some((entity, kind))
}

pub fn manifest_dir(entity: Entity) -> String {
    format!("{}/{}", MANIFESTS_ROOT, entity.as_str())
}

pub fn manifest_path(entity: Entity, run_id: &str) -> String {
    format!("{}/manifest-{}.json", manifest_dir(entity), run_id)
}

pub fn snapshot_dir(snapshot_id: &str) -> String {
    format!("{}/{}", SNAPSHOTS_ROOT, snapshot_id)
}

pub fn snapshot_db_path(snapshot_id: &str) -> String {
    format!("{}/snapshot.db", snapshot_dir(snapshot_id))
}

pub fn snapshot_sidecar_path(snapshot_id: &str) -> String {
    format!("{}/snapshot.json", snapshot_dir(snapshot_id))
}

pub fn compaction_audit_path(batch_id: &str) -> String {
    format!("_compaction/audit/{}.json", batch_id)
}
