//! Explicitly constructed on-disk storage handle.
//!
//! Create one at startup and pass it around by `Arc`. File operations are
//! serialized through an internal lock, and writes go to a temporary file
//! that is renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};

#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    lock: Mutex<()>,
}

impl Storage {
    /// Open (creating if needed) a storage directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!("Opened storage at {}", root.display());
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let _guard = self.lock.lock().await;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!(".{}.tmp", key));
        let _guard = self.lock.lock().await;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove a key. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        let _guard = self.lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(TransportError::Storage(format!("invalid storage key {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("hypo-storage-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = scratch_dir();
        let storage = Storage::open(&dir).await.unwrap();

        assert_eq!(storage.read("pref.json").await.unwrap(), None);
        storage.write("pref.json", b"{}").await.unwrap();
        assert_eq!(storage.read("pref.json").await.unwrap(), Some(b"{}".to_vec()));
        assert!(storage.remove("pref.json").await.unwrap());
        assert!(!storage.remove("pref.json").await.unwrap());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let dir = scratch_dir();
        let storage = Storage::open(&dir).await.unwrap();

        assert!(matches!(
            storage.write("../evil", b"x").await,
            Err(TransportError::Storage(_))
        ));
        assert!(storage.read("").await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_a_whole_value() {
        let dir = scratch_dir();
        let storage = Arc::new(Storage::open(&dir).await.unwrap());

        let tasks: Vec<_> = (0..16u8)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.write("value", &[i; 1024]).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let value = storage.read("value").await.unwrap().unwrap();
        assert_eq!(value.len(), 1024);
        assert!(value.iter().all(|&b| b == value[0]));

        let _ = std::fs::remove_dir_all(dir);
    }
}
