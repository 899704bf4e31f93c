//! Filesystem-backed `BlobStore`. The one concrete object-store backend
//! shipped with this crate; an S3-compatible backend would implement the
//! same [`super::BlobStore`] trait outside the core (spec §1).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::LogError;
use crate::storage::BlobStore;

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LogError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| LogError::Storage(format!("creating blob root {root:?}: {e}")))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), LogError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| LogError::Storage(format!("creating dir {parent:?}: {e}")))?;
        }
        // Write to a temp file in the same directory, then rename, so a
        // concurrent reader never observes a partially-written tile.
        let tmp_path = tmp_path_for(&path);
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| LogError::Storage(format!("creating {tmp_path:?}: {e}")))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| LogError::Storage(format!("writing {tmp_path:?}: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| LogError::Storage(format!("fsync {tmp_path:?}: {e}")))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| LogError::Storage(format!("renaming into {path:?}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, LogError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LogError::NotFound),
            Err(e) => Err(LogError::Storage(format!("reading {path:?}: {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, LogError> {
        Ok(fs::metadata(self.path_for(key)).await.is_ok())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, LogError> {
        let base = self.path_for(prefix);
        let mut out = Vec::new();
        if fs::metadata(&base).await.is_err() {
            return Ok(out);
        }
        walk(&self.root, &base, &mut out).await?;
        out.sort();
        Ok(out)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn walk(root: &Path, start: &Path, out: &mut Vec<String>) -> Result<(), LogError> {
    let mut stack = vec![start.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let metadata = fs::metadata(&dir)
            .await
            .map_err(|e| LogError::Storage(format!("stat {dir:?}: {e}")))?;
        if metadata.is_file() {
            if let Ok(rel) = dir.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
            continue;
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| LogError::Storage(format!("reading dir {dir:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LogError::Storage(format!("iterating dir {dir:?}: {e}")))?
        {
            stack.push(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        store.put("tile/0/000", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("tile/0/000").await.unwrap(), vec![1, 2, 3]);
        assert!(store.exists("tile/0/000").await.unwrap());
        assert!(!store.exists("tile/0/001").await.unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, LogError::NotFound));
    }

    #[tokio::test]
    async fn list_prefix_finds_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        store.put("tile/0/000", vec![0]).await.unwrap();
        store.put("tile/0/001.p/44", vec![1]).await.unwrap();
        let mut keys = store.list_prefix("tile/0").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tile/0/000", "tile/0/001.p/44"]);
    }
}
