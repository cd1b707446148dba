//! Object storage client for forecast files (GCS, S3, in-memory and local paths).

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, memory::InMemory, path::Path,
    ObjectStore,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use nwp_common::{Locator, NwpError, NwpResult, Scheme};

use crate::handle::ObjectStoreHandle;

/// Configuration for object storage connections.
///
/// Credentials are read from the environment by the underlying builders
/// (`GOOGLE_APPLICATION_CREDENTIALS`, `AWS_ACCESS_KEY_ID`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// S3-compatible endpoint URL (MinIO etc.); AWS when unset
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub s3_region: String,
    /// Allow HTTP endpoints (for local MinIO)
    #[serde(default)]
    pub allow_http: bool,
    /// Path to a GCS service account key; application default credentials when unset
    #[serde(default)]
    pub gcs_service_account_path: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            s3_endpoint: None,
            s3_region: default_region(),
            allow_http: false,
            gcs_service_account_path: None,
        }
    }
}

type StoreKey = (Scheme, String);

/// Object storage client routing each locator to its backing store.
///
/// One store is built lazily per (scheme, bucket) and reused; local paths
/// go straight to the filesystem.
pub struct ObjectStorage {
    config: ObjectStorageConfig,
    stores: RwLock<HashMap<StoreKey, Arc<dyn ObjectStore>>>,
}

impl ObjectStorage {
    pub fn new(config: ObjectStorageConfig) -> Self {
        Self {
            config,
            stores: RwLock::new(HashMap::new()),
        }
    }

    fn store_for(&self, scheme: Scheme, bucket: &str) -> NwpResult<Arc<dyn ObjectStore>> {
        let key = (scheme, bucket.to_string());

        if let Some(store) = self
            .stores
            .read()
            .map_err(|_| NwpError::StorageError("store cache poisoned".to_string()))?
            .get(&key)
        {
            return Ok(store.clone());
        }

        let store = self.build_store(scheme, bucket)?;
        let mut stores = self
            .stores
            .write()
            .map_err(|_| NwpError::StorageError("store cache poisoned".to_string()))?;
        Ok(stores.entry(key).or_insert(store).clone())
    }

    fn build_store(&self, scheme: Scheme, bucket: &str) -> NwpResult<Arc<dyn ObjectStore>> {
        debug!(scheme = scheme.as_str(), bucket = %bucket, "Creating object store client");

        let store: Arc<dyn ObjectStore> = match scheme {
            Scheme::Gcs => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                if let Some(path) = &self.config.gcs_service_account_path {
                    builder = builder.with_service_account_path(path);
                }
                Arc::new(builder.build().map_err(|e| {
                    NwpError::StorageError(format!("Failed to create GCS client: {}", e))
                })?)
            }
            Scheme::S3 => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(&self.config.s3_region);
                if let Some(endpoint) = &self.config.s3_endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if self.config.allow_http {
                    builder = builder.with_allow_http(true);
                }
                Arc::new(builder.build().map_err(|e| {
                    NwpError::StorageError(format!("Failed to create S3 client: {}", e))
                })?)
            }
            Scheme::Memory => Arc::new(InMemory::new()),
        };

        Ok(store)
    }

    /// Read a whole object or local file into memory.
    #[instrument(skip(self), fields(locator = %locator))]
    pub async fn read_bytes(&self, locator: &Locator) -> NwpResult<Bytes> {
        match locator {
            Locator::Local(path) => Ok(Bytes::from(fs::read(path).await?)),
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let store = self.store_for(*scheme, bucket)?;
                let bytes = store.get(&Path::from(key.as_str())).await?.bytes().await?;
                debug!(size = bytes.len(), "Read object");
                Ok(bytes)
            }
        }
    }

    /// Write bytes to an object or local file.
    ///
    /// Local writes go to a `.partial` sibling first and are renamed into
    /// place, so a visible file is always complete.
    #[instrument(skip(self, data), fields(locator = %locator, size = data.len()))]
    pub async fn write_bytes(&self, locator: &Locator, data: Bytes) -> NwpResult<u64> {
        let size = data.len() as u64;
        match locator {
            Locator::Local(path) => {
                write_local_atomic(path, &data).await?;
            }
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let store = self.store_for(*scheme, bucket)?;
                store.put(&Path::from(key.as_str()), data).await?;
            }
        }
        debug!("Wrote object");
        Ok(size)
    }

    /// Open a remote object as a stream of chunks.
    async fn remote_stream(
        &self,
        scheme: Scheme,
        bucket: &str,
        key: &str,
    ) -> NwpResult<ByteStream> {
        let store = self.store_for(scheme, bucket)?;
        let result = store.get(&Path::from(key)).await?;
        Ok(result.into_stream().map_err(NwpError::from).boxed())
    }
}

type ByteStream = BoxStream<'static, NwpResult<Bytes>>;

fn partial_path(path: &FsPath) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

async fn create_parent(path: &FsPath) -> NwpResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Rename a finished `.partial` into place, or drop it if writing failed.
async fn finish_partial<T>(
    partial: &FsPath,
    path: &FsPath,
    written: NwpResult<T>,
) -> NwpResult<T> {
    let value = match written {
        Ok(value) => value,
        Err(e) => {
            fs::remove_file(partial).await.ok();
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(partial, path).await {
        fs::remove_file(partial).await.ok();
        return Err(e.into());
    }
    Ok(value)
}

async fn write_local_atomic(path: &FsPath, data: &[u8]) -> NwpResult<()> {
    create_parent(path).await?;
    let partial = partial_path(path);
    let written = fs::write(&partial, data).await.map_err(NwpError::from);
    finish_partial(&partial, path, written).await
}

/// Stream chunks into `<path>.partial`, renaming on completion.
async fn write_local_stream(path: &FsPath, mut stream: ByteStream) -> NwpResult<u64> {
    create_parent(path).await?;
    let partial = partial_path(path);

    let written = async {
        let mut file = fs::File::create(&partial).await?;
        let mut size = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<_, NwpError>(size)
    }
    .await;

    finish_partial(&partial, path, written).await
}

/// Copy a local file via `.partial` so `dst` never appears half written.
async fn copy_local_atomic(src: &FsPath, dst: &FsPath) -> NwpResult<u64> {
    create_parent(dst).await?;
    let partial = partial_path(dst);
    let copied = fs::copy(src, &partial).await.map_err(NwpError::from);
    finish_partial(&partial, dst, copied).await
}

/// Upload a local file through a multipart writer, aborting on failure.
async fn upload_file(store: &dyn ObjectStore, path: &Path, file: &mut fs::File) -> NwpResult<u64> {
    let (id, mut writer) = store.put_multipart(path).await?;
    let uploaded = async {
        let size = tokio::io::copy(file, &mut writer).await?;
        writer.shutdown().await?;
        Ok::<_, NwpError>(size)
    }
    .await;

    if uploaded.is_err() {
        if let Err(e) = store.abort_multipart(path, &id).await {
            warn!(path = %path, error = %e, "Failed to abort multipart upload");
        }
    }
    uploaded
}

async fn upload_stream(
    store: &dyn ObjectStore,
    path: &Path,
    mut stream: ByteStream,
) -> NwpResult<u64> {
    let (id, mut writer) = store.put_multipart(path).await?;
    let uploaded = async {
        let mut size = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            writer.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        writer.shutdown().await?;
        Ok::<_, NwpError>(size)
    }
    .await;

    if uploaded.is_err() {
        if let Err(e) = store.abort_multipart(path, &id).await {
            warn!(path = %path, error = %e, "Failed to abort multipart upload");
        }
    }
    uploaded
}

fn walk_local_files(root: &FsPath) -> NwpResult<Vec<Locator>> {
    let mut paths = Vec::new();
    if !root.exists() {
        return Ok(paths);
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| NwpError::StorageError(e.to_string()))?;
        if entry.file_type().is_file() {
            paths.push(Locator::Local(entry.into_path()));
        }
    }
    paths.sort();
    Ok(paths)
}

#[async_trait]
impl ObjectStoreHandle for ObjectStorage {
    async fn exists(&self, locator: &Locator) -> NwpResult<bool> {
        match locator {
            Locator::Local(path) => Ok(fs::try_exists(path).await?),
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let store = self.store_for(*scheme, bucket)?;
                match store.head(&Path::from(key.as_str())).await {
                    Ok(_) => Ok(true),
                    Err(object_store::Error::NotFound { .. }) => Ok(false),
                    Err(e) => Err(NwpError::StorageError(format!(
                        "Failed to check {}: {}",
                        locator, e
                    ))),
                }
            }
        }
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn get(&self, locator: &Locator, dest: &FsPath) -> NwpResult<u64> {
        let size = match locator {
            Locator::Local(src) => copy_local_atomic(src, dest).await?,
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let stream = self.remote_stream(*scheme, bucket, key).await?;
                write_local_stream(dest, stream).await?
            }
        };
        debug!(size, "Downloaded object");
        Ok(size)
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn put(&self, src: &FsPath, locator: &Locator) -> NwpResult<u64> {
        let size = match locator {
            Locator::Local(dst) => copy_local_atomic(src, dst).await?,
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let store = self.store_for(*scheme, bucket)?;
                let mut file = fs::File::open(src).await?;
                upload_file(store.as_ref(), &Path::from(key.as_str()), &mut file).await?
            }
        };
        debug!(size, "Uploaded object");
        Ok(size)
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn copy(&self, from: &Locator, to: &Locator) -> NwpResult<u64> {
        match (from, to) {
            (Locator::Local(src), Locator::Local(dst)) => copy_local_atomic(src, dst).await,
            (Locator::Remote { .. }, Locator::Local(dst)) => self.get(from, dst).await,
            (Locator::Local(src), Locator::Remote { .. }) => self.put(src, to).await,
            (
                Locator::Remote {
                    scheme: s1,
                    bucket: b1,
                    key: k1,
                },
                Locator::Remote {
                    scheme: s2,
                    bucket: b2,
                    key: k2,
                },
            ) => {
                if s1 == s2 && b1 == b2 {
                    // Same bucket: server-side copy
                    let store = self.store_for(*s1, b1)?;
                    let dst = Path::from(k2.as_str());
                    store.copy(&Path::from(k1.as_str()), &dst).await?;
                    return Ok(store.head(&dst).await?.size as u64);
                }
                let stream = self.remote_stream(*s1, b1, k1).await?;
                let store = self.store_for(*s2, b2)?;
                upload_stream(store.as_ref(), &Path::from(k2.as_str()), stream).await
            }
        }
    }

    async fn list(&self, prefix: &Locator) -> NwpResult<Vec<Locator>> {
        match prefix {
            Locator::Local(root) => {
                let root = root.clone();
                tokio::task::spawn_blocking(move || walk_local_files(&root))
                    .await
                    .map_err(|e| NwpError::StorageError(format!("List task failed: {}", e)))?
            }
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let store = self.store_for(*scheme, bucket)?;
                let prefix_path = Path::from(key.as_str());
                let mut paths = Vec::new();

                let mut stream = store.list(Some(&prefix_path));
                while let Some(meta) = stream
                    .try_next()
                    .await
                    .map_err(|e| NwpError::StorageError(format!("List failed: {}", e)))?
                {
                    paths.push(Locator::remote(
                        *scheme,
                        bucket.clone(),
                        meta.location.to_string(),
                    ));
                }

                paths.sort();
                Ok(paths)
            }
        }
    }

    async fn delete(&self, locator: &Locator) -> NwpResult<()> {
        match locator {
            Locator::Local(path) => Ok(fs::remove_file(path).await?),
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let store = self.store_for(*scheme, bucket)?;
                store.delete(&Path::from(key.as_str())).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(key: &str) -> Locator {
        Locator::remote(Scheme::Memory, "bucket", key)
    }

    #[tokio::test]
    async fn test_memory_put_exists_list() {
        let storage = ObjectStorage::new(ObjectStorageConfig::default());

        assert!(!storage.exists(&memory("gfs/f000")).await.unwrap());
        storage
            .write_bytes(&memory("gfs/f000"), Bytes::from_static(b"GRIB"))
            .await
            .unwrap();
        storage
            .write_bytes(&memory("gfs/f001"), Bytes::from_static(b"GRIB7777"))
            .await
            .unwrap();

        assert!(storage.exists(&memory("gfs/f000")).await.unwrap());

        let listed = storage.list(&memory("gfs")).await.unwrap();
        assert_eq!(listed, vec![memory("gfs/f000"), memory("gfs/f001")]);
    }

    #[tokio::test]
    async fn test_same_bucket_copy_is_server_side() {
        let storage = ObjectStorage::new(ObjectStorageConfig::default());
        storage
            .write_bytes(&memory("src/a"), Bytes::from_static(b"12345"))
            .await
            .unwrap();

        let n = storage.copy(&memory("src/a"), &memory("dst/a")).await.unwrap();
        assert_eq!(n, 5);
        assert!(storage.exists(&memory("dst/a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let storage = ObjectStorage::new(ObjectStorageConfig::default());
        let err = storage
            .copy(&memory("nope"), &Locator::remote(Scheme::Memory, "other", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NwpError::NotFound(_)));
    }
}
