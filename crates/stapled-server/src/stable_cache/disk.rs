//! Folder-backed stable cache: one file per key

use super::StableCache;
use crate::error::StableCacheError;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Writes go to a uniquely named hidden temp file first and are renamed into
/// place, so a crash never leaves a truncated response behind and concurrent
/// writers never share a temp file.
#[derive(Debug, Clone)]
pub struct DiskCache {
    folder: PathBuf,
}

impl DiskCache {
    /// Create the backend, creating `folder` if needed
    pub async fn new(folder: impl Into<PathBuf>) -> Result<Self, StableCacheError> {
        let folder = folder.into();
        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|source| StableCacheError::Io {
                key: folder.display().to_string(),
                source,
            })?;
        Ok(Self { folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StableCacheError> {
        validate_key(key)?;
        Ok(self.folder.join(key))
    }
}

/// Keys must be a single, non-hidden path component
fn validate_key(key: &str) -> Result<(), StableCacheError> {
    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StableCacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StableCacheError + '_ {
    move |source| StableCacheError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl StableCache for DiskCache {
    fn name(&self) -> &str {
        "disk"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StableCacheError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key)(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StableCacheError> {
        let path = self.path_for(key)?;
        let folder = self.folder.clone();
        let value = value.to_vec();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&folder)?;
            tmp.write_all(&value)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await;
        match written {
            Ok(result) => result.map_err(io_error(key)),
            Err(e) => Err(io_error(key)(std::io::Error::other(e))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StableCacheError> {
        let key = self.folder.display().to_string();
        let mut dir = tokio::fs::read_dir(&self.folder)
            .await
            .map_err(io_error(&key))?;

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_error(&key))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let response = vec![0x30, 0x03, 0x0A, 0x01, 0x00];

        let cache = DiskCache::new(dir.path()).await.unwrap();
        cache.put("abcdef", &response).await.unwrap();

        let reopened = DiskCache::new(dir.path()).await.unwrap();
        assert_eq!(reopened.get("abcdef").await.unwrap(), Some(response));
        assert_eq!(reopened.get("missing").await.unwrap(), None);
        assert_eq!(reopened.list().await.unwrap(), vec!["abcdef"]);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).await.unwrap();
        cache.put("key", b"first").await.unwrap();
        cache.put("key", b"second").await.unwrap();
        assert_eq!(cache.get("key").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(cache.list().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).await.unwrap();

        let writers: Vec<_> = (0u8..16)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.put("shared", &vec![i; 4096]).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        // One complete value survives and no temp files are left behind
        let stored = cache.get("shared").await.unwrap().unwrap();
        assert_eq!(stored.len(), 4096);
        assert!(stored.iter().all(|b| *b == stored[0]));
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["shared"]);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("nested")).await.unwrap();
        assert!(cache.folder().exists());

        for key in ["", "..", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                cache.put(key, b"x").await,
                Err(StableCacheError::InvalidKey(_))
            ));
        }
    }
}
