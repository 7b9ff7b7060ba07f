//! Manifest listing

use crate::error::Result;
use crate::manifest::{ManifestInfo, ManifestOrigin, ManifestStore};
use crate::registry::Entity;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ManifestSummary {
    pub run_id: String,
    pub entity: Entity,
    pub schema_version: u32,
    pub pipeline_version: String,
    pub origin: ManifestOrigin,
    pub created_at: DateTime<Utc>,
    pub files: usize,
    pub rows: u64,
    pub bytes: u64,
    pub supersedes: Vec<String>,
}

impl From<&ManifestInfo> for ManifestSummary {
    fn from(info: &ManifestInfo) -> Self {
        Self {
            run_id: info.run_id.clone(),
            entity: info.entity,
            schema_version: info.schema_version,
            pipeline_version: info.pipeline_version.clone(),
            origin: info.origin,
            created_at: info.created_at,
            files: info.files.len(),
            rows: info.primary_rows(),
            bytes: info.total_bytes(),
            supersedes: info.supersedes.clone(),
        }
    }
}

/// List live manifests, optionally for a single entity
pub async fn cmd_manifests(storage: &Storage, entity: Option<Entity>) -> Result<Vec<ManifestSummary>> {
    info!("Listing manifests");

    let manifests = ManifestStore::new(storage.clone()).discover(None).await?;
    Ok(manifests
        .iter()
        .filter(|m| entity.map_or(true, |e| m.entity == e))
        .map(ManifestSummary::from)
        .collect())
}

pub fn print_manifests(manifests: &[ManifestSummary]) {
    println!("\n📜 Live Manifests\n");

    if manifests.is_empty() {
        println!("No manifests found.");
        return;
    }

    for m in manifests {
        let origin = match m.origin {
            ManifestOrigin::Ingest => "ingest",
            ManifestOrigin::Compaction => "compaction",
        };
        println!("• {} v{} [{}]", m.entity, m.schema_version, origin);
        println!("  Run: {}", m.run_id);
        println!("  Created: {}", m.created_at);
        println!("  Pipeline: {}", m.pipeline_version);
        println!("  Files: {}, Rows: {}, Bytes: {}", m.files, m.rows, m.bytes);
        if !m.supersedes.is_empty() {
            println!("  Supersedes: {}", m.supersedes.len());
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{doc_chunk_run, media_asset, media_run, text_vector};
    use crate::writer::RunWriter;

    #[tokio::test]
    async fn test_filters_by_entity() {
        let storage = Storage::in_memory("v1");
        let writer = RunWriter::new(storage.clone());
        writer
            .write_run(&media_run(vec![media_asset("m1", "document", None)]))
            .await
            .unwrap();
        writer
            .write_run(&doc_chunk_run("m1", &[("c1", "hello", text_vector(0))]))
            .await
            .unwrap();

        assert_eq!(cmd_manifests(&storage, None).await.unwrap().len(), 2);

        let docs = cmd_manifests(&storage, Some(Entity::DocChunk)).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].entity, Entity::DocChunk);
        assert_eq!(docs[0].rows, 1);
    }
}
