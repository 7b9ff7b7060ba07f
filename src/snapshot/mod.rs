//! Read-only query snapshots
//!
//! A snapshot is a single SQLite file holding every vertex entity joined
//! across its core/text/vector sub-tables, every edge table, and the
//! parameters of the HNSW index built over each vector column. It is
//! published under `snapshots/<id>/` together with a JSON sidecar, after
//! which the `snapshots/LATEST.json` pointer is replaced.

pub mod ann;
mod builder;
mod loader;

pub use ann::{AnnHit, AnnIndex, AnnParams};
pub use builder::*;
pub use loader::*;

use crate::error::Result;
use crate::registry::{self, Entity, FieldType, FileKind, TableSchema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the row-position column shared by tables and HNSW point ids
pub const ANN_ID_COLUMN: &str = "ann_id";

/// Name of the vector column in vertex tables
pub const EMBEDDING_COLUMN: &str = "embedding";

/// Size and parameters of one built index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSize {
    pub column: String,
    pub dimension: usize,
    pub points: usize,
    pub approx_bytes: u64,
    pub m: usize,
    pub ef_construction: usize,
}

/// JSON sidecar published next to every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSidecar {
    pub snapshot_id: String,
    pub build_time: DateTime<Utc>,
    pub row_counts_by_entity: BTreeMap<String, u64>,
    pub index_sizes: BTreeMap<String, IndexSize>,
    pub duration_ms: u64,
    /// Newest manifest timestamp included in the snapshot
    pub watermark: Option<DateTime<Utc>>,
    pub manifest_count: usize,
}

/// Contents of `snapshots/LATEST.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub snapshot_id: String,
    pub published_at: DateTime<Utc>,
}

/// Column layout of a vertex or edge table inside a snapshot.
///
/// Vertex tables carry the union of every registered version of the core
/// sub-table, followed by the non-key text columns and the embedding, so a
/// snapshot always exposes every column regardless of which versions were
/// ingested.
pub fn table_layout(entity: Entity) -> Result<TableSchema> {
    let union = |kind: FileKind| -> Result<TableSchema> {
        let versions = (1..=entity.latest_version())
            .map(|v| registry::schema_for(entity, kind, v))
            .collect::<Result<Vec<_>>>()?;
        registry::merge_schemas(&versions)
    };

    if entity.is_edge() {
        return union(FileKind::AdjList);
    }

    let mut layout = union(FileKind::Core)?;
    for kind in [FileKind::Text, FileKind::Vector] {
        if !entity.has_kind(kind) {
            continue;
        }
        let extra = union(kind)?;
        layout.fields.extend(
            extra
                .fields
                .into_iter()
                .filter(|f| f.name != "id" && f.name != "schema_version"),
        );
    }
    Ok(layout)
}

/// SQLite column type for a registry type
pub fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Utf8 => "TEXT",
        FieldType::Int64 | FieldType::Boolean => "INTEGER",
        FieldType::Float64 => "REAL",
        FieldType::Vector(_) => "BLOB",
    }
}

/// Encode a vector as little-endian f32 bytes
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Fixed tables present in every snapshot
pub const SNAPSHOT_META_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ann_indexes (
    entity TEXT NOT NULL,
    column_name TEXT NOT NULL,
    space TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    m INTEGER NOT NULL,
    ef_construction INTEGER NOT NULL,
    ef_search INTEGER NOT NULL,
    points INTEGER NOT NULL,
    approx_bytes INTEGER NOT NULL,
    PRIMARY KEY (entity, column_name)
);
"#;

/// `CREATE TABLE` statement for an entity
pub fn create_table_sql(entity: Entity) -> Result<String> {
    let layout = table_layout(entity)?;
    let mut columns = Vec::with_capacity(layout.fields.len() + 1);

    if entity.is_edge() {
        for field in &layout.fields {
            columns.push(format!("\"{}\" {}", field.name, sql_type(field.field_type)));
        }
        columns.push("PRIMARY KEY (src_id, dst_id)".to_string());
    } else {
        columns.push(format!("{} INTEGER PRIMARY KEY", ANN_ID_COLUMN));
        for field in &layout.fields {
            let constraint = if field.name == "id" {
                " NOT NULL UNIQUE"
            } else {
                ""
            };
            columns.push(format!(
                "\"{}\" {}{}",
                field.name,
                sql_type(field.field_type),
                constraint
            ));
        }
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        entity.table_name(),
        columns.join(",\n    ")
    ))
}
