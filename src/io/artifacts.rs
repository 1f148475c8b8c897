//! Artifact transfer with a process-wide download cache.
//!
//! Every remote file reference a worker touches goes through one
//! [`ArtifactStore`]. Downloads are keyed by the URI string and land in a cache
//! directory that is never evicted for the life of the process; concurrent
//! fetches of the same URI share a single download.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::object_store::ObjectStore;
use super::uri::{FileReference, ObjectUri};
use crate::config::HTTP_FETCH_TIMEOUT;
use crate::error::SweepError;

pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    cache_dir: PathBuf,
    /// Owns the cache directory when none was supplied
    _cache_guard: Option<TempDir>,
    entries: DashMap<String, Arc<OnceCell<PathBuf>>>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
}

impl ArtifactStore {
    /// Create a store whose cache lives in a fresh temporary directory
    pub fn new(store: Arc<dyn ObjectStore>) -> Result<Self> {
        let guard = TempDir::new().context("Failed to create artifact cache directory")?;
        let cache_dir = guard.path().to_path_buf();
        Ok(Self::build(store, cache_dir, Some(guard)))
    }

    /// Create a store caching into an existing directory
    ///
    /// Files already present in the directory count as cache hits, so a
    /// persistent directory survives worker restarts.
    pub fn with_cache_dir(store: Arc<dyn ObjectStore>, cache_dir: impl Into<PathBuf>) -> Self {
        Self::build(store, cache_dir.into(), None)
    }

    fn build(store: Arc<dyn ObjectStore>, cache_dir: PathBuf, guard: Option<TempDir>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            cache_dir,
            _cache_guard: guard,
            entries: DashMap::new(),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Number of network downloads performed so far
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Number of objects actually written by `upload`
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Resolve a file reference to a local path, downloading at most once per URI
    pub async fn fetch(&self, reference: &FileReference) -> Result<PathBuf> {
        if let FileReference::LocalPath(path) = reference {
            if fs::try_exists(path).await.unwrap_or(false) {
                return Ok(path.clone());
            }
            return Err(SweepError::artifact_transfer(reference, "local file does not exist").into());
        }

        let key = reference.to_string();
        let cell = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let path = cell
            .get_or_try_init(|| self.download(reference))
            .await?
            .clone();
        Ok(path)
    }

    /// Where a given reference is cached
    pub fn cache_path(&self, reference: &FileReference) -> PathBuf {
        let digest = hex::encode(Sha256::digest(reference.to_string().as_bytes()));
        let file_name = reference
            .file_name()
            .unwrap_or_else(|| "artifact".to_string());
        self.cache_dir.join(&digest[..16]).join(file_name)
    }

    async fn download(&self, reference: &FileReference) -> Result<PathBuf> {
        let target = self.cache_path(reference);
        if fs::try_exists(&target).await.unwrap_or(false) {
            debug!("Cache hit on disk for {}", reference);
            return Ok(target);
        }

        let body = match reference {
            FileReference::ObjectUri(uri) => self
                .store
                .get(uri)
                .await
                .map_err(|e| SweepError::artifact_transfer(uri, e))?,
            FileReference::HttpUrl(url) => self.fetch_http(url).await?,
            FileReference::LocalPath(path) => {
                return Err(SweepError::artifact_transfer(
                    path.display(),
                    "local paths are not downloadable",
                )
                .into());
            }
        };

        write_atomic(&target, &body)
            .await
            .map_err(|e| SweepError::artifact_transfer(reference, e))?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        debug!("Downloaded {} ({} bytes) to {}", reference, body.len(), target.display());

        Ok(target)
    }

    async fn fetch_http(&self, url: &url::Url) -> Result<Bytes> {
        let response = self
            .http
            .get(url.clone())
            .timeout(HTTP_FETCH_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SweepError::artifact_transfer(url, e))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| SweepError::artifact_transfer(url, e))?;
        Ok(body)
    }

    /// Upload a local file to `<prefix>/<file name>`
    ///
    /// A destination that already holds identical content is left untouched.
    /// Differing content is overwritten.
    pub async fn upload(&self, local_path: &Path, prefix: &ObjectUri) -> Result<ObjectUri> {
        let file_name = local_path
            .file_name()
            .with_context(|| format!("Cannot upload {} without a file name", local_path.display()))?
            .to_string_lossy()
            .into_owned();
        let destination = prefix.join(&file_name);

        let body = fs::read(local_path)
            .await
            .map_err(|e| SweepError::artifact_transfer(local_path.display(), e))?;
        let body = Bytes::from(body);

        let already_present = self
            .store
            .exists(&destination)
            .await
            .map_err(|e| SweepError::artifact_transfer(&destination, e))?;

        if already_present {
            let existing = self
                .store
                .get(&destination)
                .await
                .map_err(|e| SweepError::artifact_transfer(&destination, e))?;
            if Sha256::digest(&existing) == Sha256::digest(&body) {
                debug!("{} already holds identical content", destination);
                return Ok(destination);
            }
            warn!(
                "Overwriting {} with different content from {}",
                destination,
                local_path.display()
            );
        }

        self.store
            .put(&destination, body)
            .await
            .map_err(|e| SweepError::artifact_transfer(&destination, e))?;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        info!("Uploaded {} to {}", local_path.display(), destination);

        Ok(destination)
    }

    pub async fn put_bytes(&self, uri: &ObjectUri, body: Bytes) -> Result<ObjectUri> {
        let uri = self
            .store
            .put(uri, body)
            .await
            .map_err(|e| SweepError::artifact_transfer(uri, e))?;
        Ok(uri)
    }

    pub async fn get_bytes(&self, uri: &ObjectUri) -> Result<Bytes> {
        let body = self
            .store
            .get(uri)
            .await
            .map_err(|e| SweepError::artifact_transfer(uri, e))?;
        Ok(body)
    }

    pub async fn exists(&self, uri: &ObjectUri) -> Result<bool> {
        let exists = self
            .store
            .exists(uri)
            .await
            .map_err(|e| SweepError::artifact_transfer(uri, e))?;
        Ok(exists)
    }

    pub async fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>> {
        let listed = self
            .store
            .list(prefix)
            .await
            .map_err(|e| SweepError::artifact_transfer(prefix, e))?;
        Ok(listed)
    }
}

/// Write through a temporary sibling so partial files are never visible
async fn write_atomic(target: &Path, body: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .context("Cache path has no parent directory")?;
    fs::create_dir_all(parent)
        .await
        .context("Failed to create cache directory")?;

    let temp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    fs::write(&temp_path, body)
        .await
        .context("Failed to write cache file")?;
    fs::rename(&temp_path, target)
        .await
        .context("Failed to move cache file into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalObjectStore;

    fn local_artifacts(dir: &TempDir) -> (Arc<LocalObjectStore>, ArtifactStore) {
        let store = Arc::new(LocalObjectStore::new(dir.path().join("store")));
        let artifacts = ArtifactStore::new(store.clone()).unwrap();
        (store, artifacts)
    }

    #[tokio::test]
    async fn test_fetch_object_is_cached() {
        let dir = TempDir::new().unwrap();
        let (store, artifacts) = local_artifacts(&dir);
        let uri = ObjectUri::new("bucket", "weather/chicago.epw");
        store.put(&uri, Bytes::from_static(b"weather")).await.unwrap();

        let reference = FileReference::from(uri);
        let first = artifacts.fetch(&reference).await.unwrap();
        let second = artifacts.fetch(&reference).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.file_name().unwrap(), "chicago.epw");
        assert_eq!(std::fs::read(&first).unwrap(), b"weather");
        assert_eq!(artifacts.download_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_download_once() {
        let dir = TempDir::new().unwrap();
        let (store, artifacts) = local_artifacts(&dir);
        let uri = ObjectUri::new("bucket", "shared.bin");
        store.put(&uri, Bytes::from(vec![7u8; 4096])).await.unwrap();

        let artifacts = Arc::new(artifacts);
        let reference = FileReference::from(uri);
        let fetches = (0..16).map(|_| {
            let artifacts = artifacts.clone();
            let reference = reference.clone();
            tokio::spawn(async move { artifacts.fetch(&reference).await.unwrap() })
        });
        let paths = futures::future::join_all(fetches).await;

        let first = paths[0].as_ref().unwrap().clone();
        assert!(paths.iter().all(|p| p.as_ref().unwrap() == &first));
        assert_eq!(artifacts.download_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing_object_is_transfer_error() {
        let dir = TempDir::new().unwrap();
        let (_store, artifacts) = local_artifacts(&dir);
        let reference = FileReference::from(ObjectUri::new("bucket", "missing.txt"));

        let err = artifacts.fetch(&reference).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::ArtifactTransfer { .. })
        ));
        assert!(crate::error::is_retryable(&err));
    }

    #[tokio::test]
    async fn test_fetch_local_path_passthrough() {
        let dir = TempDir::new().unwrap();
        let (_store, artifacts) = local_artifacts(&dir);
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"local").unwrap();

        let fetched = artifacts.fetch(&FileReference::local(&path)).await.unwrap();
        assert_eq!(fetched, path);
        assert_eq!(artifacts.download_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, artifacts) = local_artifacts(&dir);
        let path = dir.path().join("result.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();
        let prefix = ObjectUri::new("bucket", "artifacts/result");

        let first = artifacts.upload(&path, &prefix).await.unwrap();
        let second = artifacts.upload(&path, &prefix).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.to_string(), "s3://bucket/artifacts/result/result.csv");
        assert_eq!(artifacts.upload_count(), 1);
        assert_eq!(store.get(&first).await.unwrap(), Bytes::from_static(b"a,b\n1,2\n"));
    }

    #[tokio::test]
    async fn test_upload_overwrites_different_content() {
        let dir = TempDir::new().unwrap();
        let (store, artifacts) = local_artifacts(&dir);
        let path = dir.path().join("result.csv");
        let prefix = ObjectUri::new("bucket", "out");

        std::fs::write(&path, b"first").unwrap();
        artifacts.upload(&path, &prefix).await.unwrap();
        std::fs::write(&path, b"second").unwrap();
        let uri = artifacts.upload(&path, &prefix).await.unwrap();

        assert_eq!(artifacts.upload_count(), 2);
        assert_eq!(store.get(&uri).await.unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_persistent_cache_dir_hits_without_download() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path().join("store")));
        let cache = dir.path().join("cache");
        let reference = FileReference::from(ObjectUri::new("bucket", "cached.txt"));

        let artifacts = ArtifactStore::with_cache_dir(store, &cache);
        let target = artifacts.cache_path(&reference);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"from disk").unwrap();

        let fetched = artifacts.fetch(&reference).await.unwrap();
        assert_eq!(fetched, target);
        assert_eq!(artifacts.download_count(), 0);
    }
}
