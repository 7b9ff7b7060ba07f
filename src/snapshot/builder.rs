use super::ann::{AnnIndex, AnnParams};
use super::{
    create_table_sql, table_layout, vector_to_blob, IndexSize, LatestPointer, SnapshotSidecar,
    ANN_ID_COLUMN, EMBEDDING_COLUMN, SNAPSHOT_META_SQL,
};
use crate::error::{Error, Result};
use crate::manifest::{group_by_version, ManifestInfo, ManifestStore};
use crate::progress;
use crate::registry::{self, Entity, FileKind};
use crate::storage::Storage;
use crate::table::{batch_to_rows, Row, Value};
use crate::writer::{decode_parquet, PartFile};
use bytes::Bytes;
use chrono::Utc;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

type BoundQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Rows of one vertex entity joined by primary key, in id order
#[derive(Debug, Default)]
struct JoinedEntity {
    rows: BTreeMap<String, Row>,
}

/// Builds and publishes snapshots from the live manifests
pub struct SnapshotBuilder {
    storage: Storage,
    manifests: ManifestStore,
    params: AnnParams,
    work_dir: PathBuf,
    progress: bool,
}

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub sidecar: SnapshotSidecar,
    /// Local copy of the published database
    pub db_path: PathBuf,
}

fn bind_value<'q>(query: BoundQuery<'q>, value: &Value) -> BoundQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Vector(v) => query.bind(vector_to_blob(v)),
    }
}

fn row_id(row: &Row, entity: Entity, kind: FileKind) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::IncompleteEntity {
            entity: entity.to_string(),
            reason: format!("{} row without an id", kind),
        })
}

impl SnapshotBuilder {
    pub fn new(storage: Storage, params: AnnParams, work_dir: PathBuf) -> Self {
        Self {
            manifests: ManifestStore::new(storage.clone()),
            storage,
            params,
            work_dir,
            progress: false,
        }
    }

    /// Show a progress bar while building
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    async fn read_part(&self, manifest: &ManifestInfo, uri: &str) -> Result<PartFile> {
        let Some(data) = self.storage.get_opt(uri).await? else {
            return Err(Error::CorruptManifest {
                manifest: manifest.uri(),
                reason: format!("referenced file {} is missing", uri),
            });
        };
        decode_parquet(uri, data)
    }

    async fn read_rows(&self, manifest: &ManifestInfo, kind: FileKind) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for file in manifest.files_of(kind) {
            let part = self.read_part(manifest, &file.uri).await?;
            rows.extend(batch_to_rows(&part.batch)?);
        }
        Ok(rows)
    }

    /// Join the sub-tables of a vertex entity by id across all manifests
    async fn join_entity(&self, entity: Entity, manifests: &[&ManifestInfo]) -> Result<JoinedEntity> {
        let mut core: BTreeMap<String, Row> = BTreeMap::new();
        let mut text: BTreeMap<String, Row> = BTreeMap::new();
        let mut vectors: BTreeMap<String, Value> = BTreeMap::new();

        for manifest in manifests {
            if let Some(kind) = manifest.missing_kinds().first() {
                return Err(Error::MissingSubTable {
                    entity: entity.to_string(),
                    kind: kind.to_string(),
                    run_id: manifest.run_id.clone(),
                });
            }

            // later manifests win; duplicates come from interrupted compactions
            for row in self.read_rows(manifest, FileKind::Core).await? {
                core.insert(row_id(&row, entity, FileKind::Core)?, row);
            }
            if entity.has_kind(FileKind::Text) {
                for row in self.read_rows(manifest, FileKind::Text).await? {
                    text.insert(row_id(&row, entity, FileKind::Text)?, row);
                }
            }
            if entity.has_kind(FileKind::Vector) {
                for mut row in self.read_rows(manifest, FileKind::Vector).await? {
                    let id = row_id(&row, entity, FileKind::Vector)?;
                    let embedding = row.remove(EMBEDDING_COLUMN).unwrap_or(Value::Null);
                    vectors.insert(id, embedding);
                }
            }
        }

        if let Some(id) = vectors.keys().chain(text.keys()).find(|id| !core.contains_key(*id)) {
            return Err(Error::IncompleteEntity {
                entity: entity.to_string(),
                reason: format!("row {} has no core row", id),
            });
        }

        let mut joined = JoinedEntity::default();
        let mut without_vector = 0usize;
        for (id, mut row) in core {
            if let Some(text_row) = text.remove(&id) {
                row.extend(
                    text_row
                        .into_iter()
                        .filter(|(k, _)| k != "id" && k != "schema_version"),
                );
            }
            if entity.has_kind(FileKind::Vector) {
                match vectors.remove(&id) {
                    Some(v) => {
                        row.insert(EMBEDDING_COLUMN.to_string(), v);
                    }
                    None => without_vector += 1,
                }
            }
            joined.rows.insert(id, row);
        }
        if without_vector > 0 {
            warn!(entity = %entity, rows = without_vector, "Rows without an embedding will not be indexed");
        }
        Ok(joined)
    }

    async fn collect_edges(&self, entity: Entity, manifests: &[&ManifestInfo]) -> Result<Vec<Row>> {
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        let mut edges = Vec::new();
        for manifest in manifests {
            if manifest.files_of(FileKind::AdjList).next().is_none() {
                return Err(Error::MissingSubTable {
                    entity: entity.to_string(),
                    kind: FileKind::AdjList.to_string(),
                    run_id: manifest.run_id.clone(),
                });
            }
            for row in self.read_rows(manifest, FileKind::AdjList).await? {
                let src = row.get("src_id").and_then(Value::as_str).unwrap_or_default();
                let dst = row.get("dst_id").and_then(Value::as_str).unwrap_or_default();
                if seen.insert((src.to_string(), dst.to_string())) {
                    edges.push(row);
                }
            }
        }
        Ok(edges)
    }

    async fn open_db(path: &Path) -> Result<SqlitePool> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SNAPSHOT_META_SQL).execute(&pool).await?;
        Ok(pool)
    }

    async fn insert_rows(pool: &SqlitePool, entity: Entity, rows: &[Row], edge: bool) -> Result<()> {
        sqlx::query(&create_table_sql(entity)?).execute(pool).await?;

        let layout = table_layout(entity)?;
        let mut columns: Vec<String> = Vec::new();
        if !edge {
            columns.push(ANN_ID_COLUMN.to_string());
        }
        columns.extend(layout.fields.iter().map(|f| format!("\"{}\"", f.name)));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let verb = if edge { "INSERT OR IGNORE" } else { "INSERT" };
        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            entity.table_name(),
            columns.join(", "),
            placeholders
        );

        let mut tx = pool.begin().await?;
        for (position, row) in rows.iter().enumerate() {
            let mut query = sqlx::query(&sql);
            if !edge {
                query = query.bind(position as i64);
            }
            for field in &layout.fields {
                query = bind_value(query, row.get(&field.name).unwrap_or(&Value::Null));
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_index(
        pool: &SqlitePool,
        entity: Entity,
        index: &AnnIndex,
        params: &AnnParams,
    ) -> Result<()> {
        let space = entity
            .embedding_space()
            .map(|s| s.as_str())
            .unwrap_or("none");
        sqlx::query(
            r#"
            INSERT INTO ann_indexes
                (entity, column_name, space, dimension, m, ef_construction, ef_search, points, approx_bytes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity.as_str())
        .bind(EMBEDDING_COLUMN)
        .bind(space)
        .bind(index.dimension() as i64)
        .bind(params.m as i64)
        .bind(params.ef_construction as i64)
        .bind(params.ef_search as i64)
        .bind(index.len() as i64)
        .bind(index.approx_bytes() as i64)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn record_meta(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO snapshot_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
        Ok(())
    }

    fn new_snapshot_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..8])
    }

    /// Build a snapshot from every live manifest and publish it. Any failure
    /// publishes nothing.
    pub async fn build(&self) -> Result<BuildOutcome> {
        let started = Instant::now();
        let snapshot_id = Self::new_snapshot_id();
        let manifests = self.manifests.discover(None).await?;
        info!(snapshot_id = %snapshot_id, manifests = manifests.len(), "Building snapshot");

        for ((entity, version), group) in group_by_version(&manifests) {
            debug!(entity = %entity, version, manifests = group.len(), "Manifest group");
        }

        let db_path = self.work_dir.join(format!("{}.db", snapshot_id));
        let pool = Self::open_db(&db_path).await?;
        let result = self
            .populate(&pool, &snapshot_id, &manifests)
            .await;
        pool.close().await;

        let (row_counts, index_sizes) = match result {
            Ok(r) => r,
            Err(e) => {
                let _ = tokio::fs::remove_file(&db_path).await;
                return Err(e);
            }
        };

        let sidecar = SnapshotSidecar {
            snapshot_id: snapshot_id.clone(),
            build_time: Utc::now(),
            row_counts_by_entity: row_counts,
            index_sizes,
            duration_ms: started.elapsed().as_millis() as u64,
            watermark: manifests.iter().map(|m| m.created_at).max(),
            manifest_count: manifests.len(),
        };
        self.publish(&db_path, &sidecar).await?;

        Ok(BuildOutcome { sidecar, db_path })
    }

    async fn populate(
        &self,
        pool: &SqlitePool,
        snapshot_id: &str,
        manifests: &[ManifestInfo],
    ) -> Result<(BTreeMap<String, u64>, BTreeMap<String, IndexSize>)> {
        let mut row_counts = BTreeMap::new();
        let mut index_sizes = BTreeMap::new();

        let bar = self
            .progress
            .then(|| progress::stage_bar(Entity::ALL.len() as u64, "Building snapshot"));

        for entity in Entity::ALL {
            let of_entity: Vec<&ManifestInfo> =
                manifests.iter().filter(|m| m.entity == entity).collect();

            if entity.is_edge() {
                let edges = self.collect_edges(entity, &of_entity).await?;
                Self::insert_rows(pool, entity, &edges, true).await?;
                row_counts.insert(entity.as_str().to_string(), edges.len() as u64);
            } else {
                let joined = self.join_entity(entity, &of_entity).await?;
                let rows: Vec<Row> = joined.rows.into_values().collect();
                Self::insert_rows(pool, entity, &rows, false).await?;
                row_counts.insert(entity.as_str().to_string(), rows.len() as u64);

                if let Some(space) = entity.embedding_space() {
                    let vectors = rows
                        .iter()
                        .map(|r| r.get(EMBEDDING_COLUMN).and_then(Value::as_vector).map(<[f32]>::to_vec))
                        .collect();
                    let index = AnnIndex::build(space.dimension(), vectors, self.params)?;
                    Self::record_index(pool, entity, &index, &self.params).await?;
                    index_sizes.insert(
                        entity.as_str().to_string(),
                        IndexSize {
                            column: EMBEDDING_COLUMN.to_string(),
                            dimension: index.dimension(),
                            points: index.len(),
                            approx_bytes: index.approx_bytes(),
                            m: self.params.m,
                            ef_construction: self.params.ef_construction,
                        },
                    );
                }
            }

            if let Some(bar) = &bar {
                bar.set_message(entity.as_str().to_string());
                bar.inc(1);
            }
        }

        Self::record_meta(pool, "snapshot_id", snapshot_id).await?;
        Self::record_meta(pool, "build_time", &Utc::now().to_rfc3339()).await?;
        Self::record_meta(pool, "manifest_count", &manifests.len().to_string()).await?;
        if let Some(watermark) = manifests.iter().map(|m| m.created_at).max() {
            Self::record_meta(pool, "watermark", &watermark.to_rfc3339()).await?;
        }

        if let Some(bar) = bar {
            bar.finish_with_message("Snapshot populated");
        }
        Ok((row_counts, index_sizes))
    }

    /// Upload the image and sidecar, then move the LATEST pointer
    async fn publish(&self, db_path: &Path, sidecar: &SnapshotSidecar) -> Result<()> {
        let id = &sidecar.snapshot_id;
        let bytes = self
            .storage
            .upload(db_path, &registry::snapshot_db_path(id))
            .await?;
        self.storage
            .put(
                &registry::snapshot_sidecar_path(id),
                Bytes::from(serde_json::to_vec_pretty(sidecar)?),
            )
            .await?;

        let pointer = LatestPointer {
            snapshot_id: id.clone(),
            published_at: Utc::now(),
        };
        self.storage
            .put(
                registry::LATEST_SNAPSHOT_POINTER,
                Bytes::from(serde_json::to_vec_pretty(&pointer)?),
            )
            .await?;

        info!(
            snapshot_id = %id,
            bytes,
            duration_ms = sidecar.duration_ms,
            "Published snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{doc_chunk_run, media_asset, media_run, text_vector};
    use crate::manifest::{ManifestFile, ManifestMeta};
    use crate::snapshot::SnapshotLoader;
    use crate::table::row;
    use crate::writer::{ColumnarWriter, Destination, RunWriter};
    use tempfile::TempDir;

    async fn seed(storage: &Storage) {
        let runs = RunWriter::new(storage.clone());
        runs.write_run(&media_run(vec![media_asset("m1", "document", Some("acme"))]))
            .await
            .unwrap();
        runs.write_run(&doc_chunk_run(
            "m1",
            &[
                ("c1", "a sample paragraph", text_vector(0)),
                ("c2", "another sample", text_vector(1)),
            ],
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_keeps_earlier_rows() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::in_memory("v1");
        seed(&storage).await;
        let builder = SnapshotBuilder::new(storage.clone(), AnnParams::default(), tmp.path().join("work"));
        let first = builder.build().await.unwrap();

        RunWriter::new(storage.clone())
            .write_run(&media_run(vec![media_asset("m2", "image", Some("acme"))]))
            .await
            .unwrap();
        let second = builder.build().await.unwrap();

        assert_eq!(second.sidecar.manifest_count, 3);
        assert_eq!(second.sidecar.row_counts_by_entity["DocChunk"], 2);
        assert_eq!(second.sidecar.row_counts_by_entity["MediaAsset"], 2);
        assert!(second.sidecar.watermark >= first.sidecar.watermark);

        let loader = SnapshotLoader::new(storage, tmp.path().join("cache"));
        let latest = loader.latest_pointer().await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, second.sidecar.snapshot_id);
    }

    #[tokio::test]
    async fn test_build_publishes_snapshot() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::in_memory("v1");
        seed(&storage).await;

        let builder = SnapshotBuilder::new(storage.clone(), AnnParams::default(), tmp.path().join("work"));
        let outcome = builder.build().await.unwrap();
        let sidecar = &outcome.sidecar;
        assert_eq!(sidecar.row_counts_by_entity["DocChunk"], 2);
        assert_eq!(sidecar.row_counts_by_entity["MediaAsset"], 1);
        assert_eq!(sidecar.row_counts_by_entity["AudioClip"], 0);
        assert_eq!(sidecar.index_sizes["DocChunk"].points, 2);
        assert_eq!(sidecar.manifest_count, 2);
        assert!(sidecar.watermark.is_some());

        let loader = SnapshotLoader::new(storage.clone(), tmp.path().join("cache"));
        let pointer = loader.latest_pointer().await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, sidecar.snapshot_id);
        assert_eq!(loader.sidecar(&pointer.snapshot_id).await.unwrap().as_ref(), Some(sidecar));

        let snapshot = loader.load_latest().await.unwrap();
        assert_eq!(snapshot.id(), sidecar.snapshot_id);
        assert_eq!(snapshot.row_count(Entity::DocChunk).await.unwrap(), 2);
        assert_eq!(snapshot.index(Entity::DocChunk).unwrap().len(), 2);
        assert!(snapshot.index(Entity::AudioClip).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_sub_table_fails_whole_build() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::in_memory("v1");
        seed(&storage).await;

        // a DocChunk manifest that only lists its core file
        let writer = ColumnarWriter::new(storage.clone());
        let run = doc_chunk_run("m1", &[("c9", "partial", text_vector(2))]);
        let core = writer
            .write_rows(
                &run.tables[&FileKind::Core],
                Destination::new(Entity::DocChunk, FileKind::Core, 1),
            )
            .await
            .unwrap();
        let partial = ManifestInfo::build(
            vec![ManifestFile::from_write(FileKind::Core, &core)],
            ManifestMeta::ingest(Entity::DocChunk, 1, "test-1"),
        );
        ManifestStore::new(storage.clone()).write(&partial).await.unwrap();

        let builder = SnapshotBuilder::new(storage.clone(), AnnParams::default(), tmp.path().to_path_buf());
        let err = builder.build().await.unwrap_err();
        assert!(matches!(err, Error::MissingSubTable { .. }));
        assert!(storage.list("snapshots").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_without_core_fails() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::in_memory("v1");
        let writer = ColumnarWriter::new(storage.clone());

        let mut files = Vec::new();
        for (kind, id) in [(FileKind::Core, "c1"), (FileKind::Text, "c1"), (FileKind::Vector, "ghost")] {
            let r = match kind {
                FileKind::Core => doc_chunk_run("m1", &[(id, "x", text_vector(0))]).tables[&FileKind::Core].clone(),
                FileKind::Text => vec![row([
                    ("id", Value::from(id)),
                    ("schema_version", Value::Int(1)),
                    ("text", Value::from("x")),
                ])],
                _ => vec![row([
                    ("id", Value::from(id)),
                    ("schema_version", Value::Int(1)),
                    ("embedding", Value::Vector(text_vector(0))),
                ])],
            };
            let result = writer
                .write_rows(&r, Destination::new(Entity::DocChunk, kind, 1))
                .await
                .unwrap();
            files.push(ManifestFile::from_write(kind, &result));
        }
        let info = ManifestInfo::build(files, ManifestMeta::ingest(Entity::DocChunk, 1, "test-1"));
        ManifestStore::new(storage.clone()).write(&info).await.unwrap();

        let builder = SnapshotBuilder::new(storage.clone(), AnnParams::default(), tmp.path().to_path_buf());
        assert!(matches!(
            builder.build().await,
            Err(Error::IncompleteEntity { .. })
        ));
        assert!(storage
            .get_opt(registry::LATEST_SNAPSHOT_POINTER)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rows_collapse() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::in_memory("v1");
        let runs = RunWriter::new(storage.clone());
        let run = doc_chunk_run("m1", &[("c1", "same chunk", text_vector(0))]);
        runs.write_run(&run).await.unwrap();
        runs.write_run(&run).await.unwrap();

        let builder = SnapshotBuilder::new(storage, AnnParams::default(), tmp.path().to_path_buf());
        let outcome = builder.build().await.unwrap();
        assert_eq!(outcome.sidecar.row_counts_by_entity["DocChunk"], 1);
    }
}
