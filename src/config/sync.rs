use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env, parse_string_env, required_env};
use crate::error::ConfigError;

/// Metric synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the shared metrics volume.
    pub mount_dir: PathBuf,
    /// Destination pointer file name, relative to `mount_dir`.
    pub pointer_file: String,
    /// Extension of telemetry files (without the dot).
    pub extension: String,
    pub interval_secs: u64,
    /// Dashboard base URL that receives uploads.
    pub dashboard_url: String,
    /// Name of the dashboard token in the secrets store.
    pub token_secret: String,
}

impl SyncConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let interval_secs = parse_optional_env("SYNC_INTERVAL_SECS", 30u64)?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            mount_dir: optional_env("SYNC_MOUNT_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/metrics")),
            pointer_file: parse_string_env("SYNC_POINTER_FILE", "space_id")?,
            extension: parse_string_env("SYNC_EXTENSION", "db")?
                .trim_start_matches('.')
                .to_string(),
            interval_secs,
            dashboard_url: required_env(
                "SYNC_DASHBOARD_URL",
                "Set SYNC_DASHBOARD_URL to the dashboard upload endpoint",
            )?,
            token_secret: parse_string_env("SYNC_TOKEN_SECRET", "HF_TOKEN")?,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
