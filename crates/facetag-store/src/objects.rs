//! Durable object storage for reference face images.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid object path: {0:?}")]
    InvalidPath(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Put/get by slash-separated relative path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`. Never overwrites an existing object.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;

    /// Fetch the object at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative object path under the root, rejecting anything
    /// that could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf, ObjectStoreError> {
        let rel = Path::new(path);
        let clean = !path.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ObjectStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        let target = self.resolve(path)?;
        let io_err = |source| ObjectStoreError::Io { path: path.to_string(), source };

        if tokio::fs::try_exists(&target).await.map_err(io_err)? {
            return Err(ObjectStoreError::AlreadyExists(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        write_then_rename(&target, &bytes).await.map_err(io_err)?;

        tracing::debug!(path, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ObjectStoreError::NotFound(path.to_string())),
            Err(source) => Err(ObjectStoreError::Io { path: path.to_string(), source }),
        }
    }
}

/// Write `bytes` beside `target` and move them into place. Readers never
/// observe a half-written object, and no temp file outlives a failure.
async fn write_then_rename(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    let result = match tokio::fs::write(&tmp, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp, target).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("faces/o/i.png", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("faces/o/i.png").await.unwrap(), vec![1, 2, 3]);
        assert!(dir.path().join("faces/o/i.png").exists());
    }

    #[tokio::test]
    async fn test_put_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("a.png", vec![1]).await.unwrap();
        let err = store.put("a.png", vec![2]).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::AlreadyExists(_)));
        assert_eq!(store.get("a.png").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory in the way makes the rename fail.
        let target = dir.path().join("taken");
        std::fs::create_dir_all(target.join("inner")).unwrap();

        assert!(write_then_rename(&target, &[1, 2, 3]).await.is_err());

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["taken".to_string()]);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(store.get("nope.png").await, Err(ObjectStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for bad in ["../x.png", "/etc/passwd", "faces/../../x", ""] {
            assert!(
                matches!(store.get(bad).await, Err(ObjectStoreError::InvalidPath(_))),
                "{bad} should be rejected"
            );
        }
    }
}
