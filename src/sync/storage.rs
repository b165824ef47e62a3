//! Views of the shared metrics volume.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::SyncError;

/// A telemetry file as seen during one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricFile {
    /// File name relative to the volume root, e.g. `run-42.db`.
    pub name: String,
    pub modified: SystemTime,
}

impl MetricFile {
    /// The project identifier: the file name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }
}

/// Read-only access to the volume the sandbox writes into.
#[async_trait]
pub trait StorageView: Send + Sync {
    /// Make the latest writes visible. Called once at the start of every cycle.
    async fn refresh(&self) -> Result<(), SyncError>;

    /// Read a file at the volume root. `Ok(None)` when it does not exist.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SyncError>;

    /// List root-level files whose extension is exactly `extension`.
    async fn list(&self, extension: &str) -> Result<Vec<MetricFile>, SyncError>;
}

/// A volume mounted as a local directory.
#[derive(Debug, Clone)]
pub struct LocalVolume {
    root: PathBuf,
}

impl LocalVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn storage_error(&self, path: &Path, e: std::io::Error) -> SyncError {
        SyncError::Storage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl StorageView for LocalVolume {
    async fn refresh(&self) -> Result<(), SyncError> {
        // A local mount is always current; confirm it is still there.
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| self.storage_error(&self.root, e))?;
        if !meta.is_dir() {
            return Err(SyncError::Storage {
                path: self.root.clone(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let path = self.root.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.storage_error(&path, e)),
        }
    }

    async fn list(&self, extension: &str) -> Result<Vec<MetricFile>, SyncError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| self.storage_error(&self.root, e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.storage_error(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::debug!("Skipping non-UTF-8 file name {}", path.display());
                continue;
            };
            // The writer may delete or replace the file between listing and stat.
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let modified = meta.modified().map_err(|e| self.storage_error(&path, e))?;
            files.push(MetricFile {
                name: name.to_string(),
                modified,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
