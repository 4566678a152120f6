//! # Filesystem Storage Adapter
//!
//! Durable key-value backend that keeps one JSON file per key in a local
//! directory.

use crate::config::StorageDriver;
use crate::error::StorageError;
use crate::persistence::StorageBackend;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const EXTENSION: &str = "json";

/// Filesystem-based storage backend
///
/// Values are written to `{base_path}/{key}.json` through a temporary file
/// that is renamed into place, so a crash mid-write leaves the previous
/// value intact. The base directory is created on first save.
///
/// # Examples
///
/// ```no_run
/// use queue_engine_core::adapters::FilesystemStorage;
/// use queue_engine_core::persistence::StorageBackend;
/// # async fn example() -> Result<(), queue_engine_core::StorageError> {
/// let storage = FilesystemStorage::new("./data/queues");
/// storage.save("queue-orders", "{}".to_string()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    /// Create storage rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Directory holding the stored files
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get file path for a key, rejecting keys that would escape the directory
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                message: "key must not be empty".to_string(),
            });
        }

        if key.starts_with('.')
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and inner dots allowed"
                    .to_string(),
            });
        }

        Ok(self.base_path.join(format!("{}.{}", key, EXTENSION)))
    }
}

fn io_error(key: &str, action: &str, e: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        message: format!("Failed to {}: {}", action, e),
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    async fn save(&self, key: &str, value: String) -> Result<(), StorageError> {
        let path = self.path_for(key)?;

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| io_error(key, "create storage directory", e))?;

        // Write to temporary file first (atomic write pattern)
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error(key, "create temp file", e))?;

        file.write_all(value.as_bytes())
            .await
            .map_err(|e| io_error(key, "write value", e))?;

        file.flush()
            .await
            .map_err(|e| io_error(key, "flush file", e))?;

        file.sync_all()
            .await
            .map_err(|e| io_error(key, "sync file", e))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_error(key, "rename temp file", e))?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;

        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, "read value", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, "delete value", e)),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut read_dir = match fs::read_dir(&self.base_path).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::Internal {
                    message: format!("Failed to read storage directory: {}", e),
                })
            }
        };

        while let Some(entry) =
            read_dir
                .next_entry()
                .await
                .map_err(|e| StorageError::Internal {
                    message: format!("Failed to read directory entry: {}", e),
                })?
        {
            let entry_path = entry.path();
            if entry_path.extension().and_then(|s| s.to_str()) == Some(EXTENSION) {
                fs::remove_file(&entry_path)
                    .await
                    .map_err(|e| StorageError::Internal {
                        message: format!(
                            "Failed to remove {}: {}",
                            entry_path.display(),
                            e
                        ),
                    })?;
            }
        }

        Ok(())
    }

    fn driver(&self) -> StorageDriver {
        StorageDriver::Filesystem
    }
}

#[cfg(test)]
#[path = "filesystem_storage_tests.rs"]
mod tests;
