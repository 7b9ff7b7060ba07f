use super::ann::{AnnIndex, AnnParams};
use super::{blob_to_vector, LatestPointer, SnapshotSidecar, ANN_ID_COLUMN, EMBEDDING_COLUMN};
use crate::error::{Error, Result};
use crate::registry::{self, Entity};
use crate::storage::Storage;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// An opened, read-only snapshot with its indexes rebuilt in memory
pub struct Snapshot {
    id: String,
    path: PathBuf,
    pool: SqlitePool,
    indexes: HashMap<Entity, AnnIndex>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

impl Snapshot {
    /// Open a snapshot file read-only and rebuild its HNSW graphs from the
    /// stored vectors with the recorded parameters
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let id: Option<(String,)> =
            sqlx::query_as("SELECT value FROM snapshot_meta WHERE key = 'snapshot_id'")
                .fetch_optional(&pool)
                .await?;
        let id = id.map(|(v,)| v).ok_or_else(|| {
            Error::Other(format!("{} is not a snapshot database", path.display()))
        })?;

        let specs = sqlx::query(
            "SELECT entity, dimension, m, ef_construction, ef_search FROM ann_indexes",
        )
        .fetch_all(&pool)
        .await?;

        let mut indexes = HashMap::new();
        for spec in specs {
            let entity: Entity = spec.try_get::<String, _>("entity")?.parse()?;
            let dimension = spec.try_get::<i64, _>("dimension")? as usize;
            let params = AnnParams {
                m: spec.try_get::<i64, _>("m")? as usize,
                ef_construction: spec.try_get::<i64, _>("ef_construction")? as usize,
                ef_search: spec.try_get::<i64, _>("ef_search")? as usize,
            };

            let rows = sqlx::query(&format!(
                "SELECT {}, {} FROM {} ORDER BY {}",
                ANN_ID_COLUMN,
                EMBEDDING_COLUMN,
                entity.table_name(),
                ANN_ID_COLUMN
            ))
            .fetch_all(&pool)
            .await?;

            let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(rows.len());
            for row in rows {
                let position = row.try_get::<i64, _>(ANN_ID_COLUMN)? as usize;
                let blob: Option<Vec<u8>> = row.try_get(EMBEDDING_COLUMN)?;
                if vectors.len() <= position {
                    vectors.resize(position + 1, None);
                }
                vectors[position] = blob.map(|b| blob_to_vector(&b));
            }

            let index = AnnIndex::build(dimension, vectors, params)?;
            debug!(entity = %entity, points = index.len(), "Rebuilt index");
            indexes.insert(entity, index);
        }

        info!(snapshot_id = %id, indexes = indexes.len(), "Opened snapshot");
        Ok(Self {
            id,
            path: path.to_path_buf(),
            pool,
            indexes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self, entity: Entity) -> Option<&AnnIndex> {
        self.indexes.get(&entity)
    }

    pub async fn row_count(&self, entity: Entity) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", entity.table_name()))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

/// Fetches published snapshots into a local cache directory
#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    storage: Storage,
    cache_dir: PathBuf,
}

impl SnapshotLoader {
    pub fn new(storage: Storage, cache_dir: PathBuf) -> Self {
        Self { storage, cache_dir }
    }

    pub async fn latest_pointer(&self) -> Result<Option<LatestPointer>> {
        match self.storage.get_opt(registry::LATEST_SNAPSHOT_POINTER).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn sidecar(&self, snapshot_id: &str) -> Result<Option<SnapshotSidecar>> {
        match self
            .storage
            .get_opt(&registry::snapshot_sidecar_path(snapshot_id))
            .await?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Download a snapshot image unless it is already cached
    pub async fn fetch(&self, snapshot_id: &str) -> Result<PathBuf> {
        let local = self.cache_dir.join(snapshot_id).join("snapshot.db");
        if tokio::fs::try_exists(&local).await? {
            debug!(snapshot_id, "Snapshot already cached");
            return Ok(local);
        }

        // download next to the final name, then rename into place
        let staging = self
            .cache_dir
            .join(snapshot_id)
            .join(format!("snapshot.db.{}.partial", uuid::Uuid::new_v4()));
        let bytes = self
            .storage
            .download(&registry::snapshot_db_path(snapshot_id), &staging)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::SnapshotNotFound
                } else {
                    e
                }
            })?;
        tokio::fs::rename(&staging, &local).await?;
        info!(snapshot_id, bytes, "Downloaded snapshot");
        Ok(local)
    }

    pub async fn load(&self, snapshot_id: &str) -> Result<Snapshot> {
        let path = self.fetch(snapshot_id).await?;
        Snapshot::open(&path).await
    }

    /// Load whatever `snapshots/LATEST.json` points at
    pub async fn load_latest(&self) -> Result<Snapshot> {
        let pointer = self.latest_pointer().await?.ok_or(Error::SnapshotNotFound)?;
        self.load(&pointer.snapshot_id).await
    }
}

/// Shared, hot-swappable reference to the active snapshot.
///
/// Queries clone the inner `Arc` and keep using it for their whole
/// duration, so a swap never disturbs in-flight work.
#[derive(Debug)]
pub struct SnapshotHandle {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub async fn current(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    /// Replace the active snapshot, returning the previous one
    pub async fn swap(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let next = Arc::new(snapshot);
        let mut guard = self.current.write().await;
        std::mem::replace(&mut *guard, next)
    }

    /// Fully open the latest published snapshot, then swap it in. On error
    /// the active snapshot is left untouched.
    pub async fn reload(&self, loader: &SnapshotLoader) -> Result<String> {
        let pointer = loader
            .latest_pointer()
            .await?
            .ok_or(Error::SnapshotNotFound)?;
        if self.current().await.id() == pointer.snapshot_id {
            return Ok(pointer.snapshot_id);
        }
        let snapshot = loader.load(&pointer.snapshot_id).await?;
        let id = snapshot.id().to_string();
        let previous = self.swap(snapshot).await;
        info!(from = %previous.id(), to = %id, "Swapped active snapshot");
        Ok(id)
    }
}
