use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use uuid::Uuid;

use super::uri::ObjectUri;

/// Trait for object storage operations
///
/// Implementations must offer read-after-write consistency: once `put`
/// returns, `get`, `exists` and `list` observe the object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an entire object
    async fn get(&self, uri: &ObjectUri) -> Result<Bytes>;

    /// Write an entire object, replacing any previous content
    async fn put(&self, uri: &ObjectUri, body: Bytes) -> Result<ObjectUri>;

    async fn exists(&self, uri: &ObjectUri) -> Result<bool>;

    /// Every object below `prefix`, sorted by key
    async fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>>;
}

/// Local filesystem implementation of ObjectStore
///
/// Directory structure:
///   {root}/{bucket}/{key}
///
/// Writes go to a hidden temporary file first and are renamed into place, so
/// readers never observe a partially written object.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path backing an object
    pub fn path_for(&self, uri: &ObjectUri) -> PathBuf {
        let mut path = self.root.join(uri.bucket());
        for segment in uri.key().split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn is_temporary(path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().starts_with(".tmp-"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Bytes> {
        let path = self.path_for(uri);
        let contents = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {}", uri))?;
        Ok(Bytes::from(contents))
    }

    async fn put(&self, uri: &ObjectUri, body: Bytes) -> Result<ObjectUri> {
        let path = self.path_for(uri);
        let parent = path
            .parent()
            .with_context(|| format!("Object {} has no parent directory", uri))?;

        fs::create_dir_all(parent)
            .await
            .context("Failed to create object directory")?;

        let temp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&temp_path, &body)
            .await
            .with_context(|| format!("Failed to write object {}", uri))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("Failed to move object {} into place", uri))?;

        Ok(uri.clone())
    }

    async fn exists(&self, uri: &ObjectUri) -> Result<bool> {
        let path = self.path_for(uri);
        let metadata = fs::metadata(&path).await;
        Ok(matches!(metadata, Ok(m) if m.is_file()))
    }

    async fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>> {
        let start = self.path_for(prefix);
        let bucket_root = self.root.join(prefix.bucket());
        let mut found = Vec::new();

        if !fs::try_exists(&start).await.unwrap_or(false) {
            return Ok(found);
        }

        let mut pending = vec![start];
        while let Some(path) = pending.pop() {
            let metadata = fs::metadata(&path)
                .await
                .with_context(|| format!("Failed to stat {}", path.display()))?;

            if metadata.is_dir() {
                let mut entries = fs::read_dir(&path)
                    .await
                    .with_context(|| format!("Failed to list {}", path.display()))?;
                while let Some(entry) = entries.next_entry().await? {
                    pending.push(entry.path());
                }
            } else if !Self::is_temporary(&path) {
                let relative = path
                    .strip_prefix(&bucket_root)
                    .context("Listed object outside its bucket")?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                found.push(ObjectUri::new(prefix.bucket(), key));
            }
        }

        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let uri = ObjectUri::new("bucket", "a/b/c.txt");

        assert!(!store.exists(&uri).await.unwrap());
        store.put(&uri, Bytes::from_static(b"hello")).await.unwrap();
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.get(&uri).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(dir.path().join("bucket/a/b/c.txt").is_file());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let uri = ObjectUri::new("bucket", "key.txt");

        store.put(&uri, Bytes::from_static(b"one")).await.unwrap();
        store.put(&uri, Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.get(&uri).await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_get_missing_fails() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let result = store.get(&ObjectUri::new("bucket", "missing")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_recursive_and_sorted() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["exp/v1.0.0/b.txt", "exp/v1.0.0/a.txt", "exp/v2.0.0/x/y.txt", "other/z.txt"] {
            store
                .put(&ObjectUri::new("bucket", key), Bytes::from_static(b"."))
                .await
                .unwrap();
        }

        let listed = store.list(&ObjectUri::new("bucket", "exp")).await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|u| u.key()).collect();
        assert_eq!(
            keys,
            vec!["exp/v1.0.0/a.txt", "exp/v1.0.0/b.txt", "exp/v2.0.0/x/y.txt"]
        );

        let empty = store.list(&ObjectUri::new("bucket", "nothing")).await.unwrap();
        assert!(empty.is_empty());
    }
}
