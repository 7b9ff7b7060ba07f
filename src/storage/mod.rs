//! Object storage access rooted at a versioned prefix
//!
//! All layout paths handed to [`Storage`] are relative to the prefix
//! (`v1/` by default). Puts are single-object writes: the local backend
//! stages each object and renames it into place, remote backends publish
//! the final key in one request, so readers never observe partial objects.

use crate::config::Config;
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A listed object
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Location relative to the storage prefix
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Handle to the store shared by writers, readers and compaction
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Storage {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// In-process store, used by tests and the `memory` backend
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(Arc::new(InMemory::new()), prefix)
    }

    /// Local filesystem store under `root`
    pub fn local(root: &Path, prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    #[cfg(feature = "s3")]
    pub fn s3(bucket: &str, region: &str, prefix: &str) -> Result<Self> {
        let store = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    /// Open the backend named in the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let prefix = config.storage.prefix.as_str();
        let storage = match config.storage.backend.as_str() {
            "local" => Self::local(&config.local_store_root(), prefix)?,
            "memory" => Self::in_memory(prefix),
            #[cfg(feature = "s3")]
            "s3" => {
                let bucket = config.storage.bucket.as_deref().ok_or_else(|| {
                    Error::Config("storage.bucket is required for the s3 backend".to_string())
                })?;
                Self::s3(bucket, &config.storage.region, prefix)?
            }
            other => {
                return Err(Error::Config(format!(
                    "Storage backend '{}' is not available in this build",
                    other
                )))
            }
        };
        info!(backend = %config.storage.backend, prefix, "Opened object storage");
        Ok(storage)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        let key = key.trim_matches('/');
        match (self.prefix.is_empty(), key.is_empty()) {
            (true, _) => ObjectPath::from(key),
            (false, true) => ObjectPath::from(self.prefix.as_str()),
            (false, false) => ObjectPath::from(format!("{}/{}", self.prefix, key)),
        }
    }

    fn relative(&self, path: &ObjectPath) -> String {
        let full = path.as_ref();
        if self.prefix.is_empty() {
            return full.to_string();
        }
        full.strip_prefix(self.prefix.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(full)
            .to_string()
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let len = data.len();
        self.store.put(&self.full_path(key), data.into()).await?;
        debug!(key, bytes = len, "Stored object");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self.store.get(&self.full_path(key)).await?;
        Ok(result.bytes().await?)
    }

    /// Like [`Storage::get`] but an absent object is `None`
    pub async fn get_opt(&self, key: &str) -> Result<Option<Bytes>> {
        match self.get(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Size of an object, or `None` if it does not exist
    pub async fn head(&self, key: &str) -> Result<Option<u64>> {
        match self.store.head(&self.full_path(key)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Recursively list objects under `prefix`, sorted by key
    pub async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let root = self.full_path(prefix);
        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&root)).try_collect().await?;

        let mut objects: Vec<StoredObject> = metas
            .into_iter()
            .map(|meta| StoredObject {
                key: self.relative(&meta.location),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Delete an object; deleting something already gone succeeds
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Download an object to a local file
    pub async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let bytes = self.get(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    /// Upload a local file to an object
    pub async fn upload(&self, src: &Path, key: &str) -> Result<u64> {
        let data = tokio::fs::read(src).await?;
        let len = data.len() as u64;
        self.put(key, Bytes::from(data)).await?;
        Ok(len)
    }
}
