//! Metric synchronizer.
//!
//! The sandbox writes telemetry files and a destination pointer into a shared
//! volume; it never holds the dashboard credential. This loop polls the volume
//! and uploads every file that changed since its last successful upload.
//!
//! Marks live in memory only. After a restart every file is uploaded once
//! more, which the dashboard treats as an overwrite.

pub mod storage;
pub mod uploader;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::error::SyncError;

pub use storage::{LocalVolume, MetricFile, StorageView};
pub use uploader::{HttpUploader, MetricUpload, Uploader};

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The pointer file was absent or blank, so nothing was attempted.
    pub no_destination: bool,
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
    pub unchanged: usize,
}

impl CycleReport {
    pub fn attempted(&self) -> usize {
        self.uploaded.len() + self.failed.len()
    }
}

/// Polls a [`StorageView`] and pushes changed files through an [`Uploader`].
pub struct MetricSynchronizer {
    storage: Arc<dyn StorageView>,
    uploader: Arc<dyn Uploader>,
    pointer_file: String,
    extension: String,
    /// Modification time of the last successful upload, per file name.
    marks: HashMap<String, SystemTime>,
}

impl MetricSynchronizer {
    pub fn new(
        storage: Arc<dyn StorageView>,
        uploader: Arc<dyn Uploader>,
        pointer_file: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            uploader,
            pointer_file: pointer_file.into(),
            extension: extension.into(),
            marks: HashMap::new(),
        }
    }

    /// Build a synchronizer over the configured local mount.
    pub fn from_config(config: &SyncConfig, uploader: Arc<dyn Uploader>) -> Self {
        Self::new(
            Arc::new(LocalVolume::new(config.mount_dir.clone())),
            uploader,
            config.pointer_file.clone(),
            config.extension.clone(),
        )
    }

    /// Last synced modification time for `name`, if any.
    pub fn mark(&self, name: &str) -> Option<SystemTime> {
        self.marks.get(name).copied()
    }

    async fn destination(&self) -> Result<Option<String>, SyncError> {
        let Some(raw) = self.storage.read(&self.pointer_file).await? else {
            return Ok(None);
        };
        let destination = String::from_utf8_lossy(&raw).trim().to_string();
        Ok((!destination.is_empty()).then_some(destination))
    }

    fn is_stale(&self, file: &MetricFile) -> bool {
        self.marks
            .get(&file.name)
            .is_none_or(|synced| file.modified > *synced)
    }

    /// Run one poll-and-upload pass.
    ///
    /// Per-file failures are logged and reported, not returned; only failures
    /// of the volume itself abort the cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();

        self.storage.refresh().await?;

        let Some(destination) = self.destination().await? else {
            tracing::debug!(pointer = %self.pointer_file, "No destination yet, skipping cycle");
            report.no_destination = true;
            return Ok(report);
        };

        for file in self.storage.list(&self.extension).await? {
            if !self.is_stale(&file) {
                report.unchanged += 1;
                continue;
            }

            match self.sync_file(&destination, &file).await {
                Ok(true) => {
                    tracing::info!(file = %file.name, destination = %destination, "Synced metrics");
                    self.marks.insert(file.name.clone(), file.modified);
                    report.uploaded.push(file.name);
                }
                // Vanished between listing and reading.
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Metric sync failed, will retry");
                    report.failed.push(file.name);
                }
            }
        }

        Ok(report)
    }

    async fn sync_file(&self, destination: &str, file: &MetricFile) -> Result<bool, SyncError> {
        let Some(contents) = self.storage.read(&file.name).await? else {
            return Ok(false);
        };
        let upload = MetricUpload {
            destination: destination.to_string(),
            project: file.stem().to_string(),
            file_name: file.name.clone(),
            contents,
        };
        self.uploader.upload(&upload).await?;
        Ok(true)
    }

    /// Poll forever, one cycle per `interval`.
    pub async fn run(mut self, interval: Duration) {
        tracing::info!(
            pointer = %self.pointer_file,
            extension = %self.extension,
            interval_secs = interval.as_secs(),
            "Metric synchronizer started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(report) if report.attempted() > 0 => tracing::debug!(
                    uploaded = report.uploaded.len(),
                    failed = report.failed.len(),
                    unchanged = report.unchanged,
                    "Sync cycle finished"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Sync cycle failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct MemoryVolume {
        files: Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
    }

    impl MemoryVolume {
        fn put(&self, name: &str, contents: &[u8], secs: u64) {
            let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
            self.files
                .lock()
                .unwrap()
                .insert(name.to_string(), (contents.to_vec(), modified));
        }
    }

    #[async_trait]
    impl StorageView for MemoryVolume {
        async fn refresh(&self) -> Result<(), SyncError> {
            Ok(())
        }

        async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SyncError> {
            Ok(self.files.lock().unwrap().get(name).map(|(c, _)| c.clone()))
        }

        async fn list(&self, extension: &str) -> Result<Vec<MetricFile>, SyncError> {
            let suffix = format!(".{extension}");
            let mut files: Vec<MetricFile> = self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name.ends_with(&suffix))
                .map(|(name, (_, modified))| MetricFile {
                    name: name.clone(),
                    modified: *modified,
                })
                .collect();
            files.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(files)
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<MetricUpload>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, upload: &MetricUpload) -> Result<(), SyncError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Upload {
                    project: upload.project.clone(),
                    reason: "dashboard unavailable".to_string(),
                });
            }
            self.uploads.lock().unwrap().push(upload.clone());
            Ok(())
        }
    }

    fn synchronizer() -> (Arc<MemoryVolume>, Arc<RecordingUploader>, MetricSynchronizer) {
        let volume = Arc::new(MemoryVolume::default());
        let uploader = Arc::new(RecordingUploader::default());
        let sync = MetricSynchronizer::new(volume.clone(), uploader.clone(), "space_id", "db");
        (volume, uploader, sync)
    }

    #[tokio::test]
    async fn missing_pointer_skips_cycle() {
        let (volume, uploader, mut sync) = synchronizer();
        volume.put("run.db", b"rows", 10);

        let report = sync.run_cycle().await.unwrap();
        assert!(report.no_destination);
        assert_eq!(report.attempted(), 0);
        assert!(uploader.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_pointer_skips_cycle() {
        let (volume, uploader, mut sync) = synchronizer();
        volume.put("space_id", b"  \n", 1);
        volume.put("run.db", b"rows", 10);

        let report = sync.run_cycle().await.unwrap();
        assert!(report.no_destination);
        assert!(uploader.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploads_once_until_modified() {
        let (volume, uploader, mut sync) = synchronizer();
        volume.put("space_id", b"team/space\n", 1);
        volume.put("run.db", b"v1", 10);

        let first = sync.run_cycle().await.unwrap();
        assert_eq!(first.uploaded, vec!["run.db"]);

        let second = sync.run_cycle().await.unwrap();
        assert_eq!(second.attempted(), 0);
        assert_eq!(second.unchanged, 1);

        volume.put("run.db", b"v2", 20);
        let third = sync.run_cycle().await.unwrap();
        assert_eq!(third.uploaded, vec!["run.db"]);

        let uploads = uploader.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].destination, "team/space");
        assert_eq!(uploads[0].project, "run");
        assert_eq!(uploads[1].contents, b"v2");
    }

    #[tokio::test]
    async fn equal_mtime_is_not_a_change() {
        let (volume, uploader, mut sync) = synchronizer();
        volume.put("space_id", b"dest", 1);
        volume.put("run.db", b"v1", 10);
        sync.run_cycle().await.unwrap();

        volume.put("run.db", b"rewritten", 10);
        sync.run_cycle().await.unwrap();
        assert_eq!(uploader.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_upload_keeps_mark_and_retries() {
        let (volume, uploader, mut sync) = synchronizer();
        volume.put("space_id", b"dest", 1);
        volume.put("run.db", b"v1", 10);

        uploader.fail.store(true, Ordering::SeqCst);
        let report = sync.run_cycle().await.unwrap();
        assert_eq!(report.failed, vec!["run.db"]);
        assert_eq!(sync.mark("run.db"), None);

        uploader.fail.store(false, Ordering::SeqCst);
        let report = sync.run_cycle().await.unwrap();
        assert_eq!(report.uploaded, vec!["run.db"]);
        assert_eq!(
            sync.mark("run.db"),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_block_other_files() {
        struct PickyUploader(Mutex<Vec<String>>);

        #[async_trait]
        impl Uploader for PickyUploader {
            async fn upload(&self, upload: &MetricUpload) -> Result<(), SyncError> {
                if upload.project == "bad" {
                    return Err(SyncError::Upload {
                        project: upload.project.clone(),
                        reason: "rejected".to_string(),
                    });
                }
                self.0.lock().unwrap().push(upload.project.clone());
                Ok(())
            }
        }

        let volume = Arc::new(MemoryVolume::default());
        let uploader = Arc::new(PickyUploader(Mutex::new(Vec::new())));
        let mut sync = MetricSynchronizer::new(volume.clone(), uploader.clone(), "space_id", "db");
        volume.put("space_id", b"dest", 1);
        volume.put("bad.db", b"x", 10);
        volume.put("good.db", b"y", 10);

        let report = sync.run_cycle().await.unwrap();
        assert_eq!(report.failed, vec!["bad.db"]);
        assert_eq!(report.uploaded, vec!["good.db"]);
        assert_eq!(*uploader.0.lock().unwrap(), vec!["good"]);
    }
}
