//! Upload targets for telemetry files.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConfigError, SyncError};
use crate::secrets::DecryptedSecret;

/// One file bound for the dashboard.
#[derive(Debug, Clone)]
pub struct MetricUpload {
    /// Destination identifier read from the pointer file.
    pub destination: String,
    /// Project identifier (the file stem).
    pub project: String,
    pub file_name: String,
    pub contents: Vec<u8>,
}

/// Pushes a telemetry file to the dashboard, overwriting any earlier copy.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, upload: &MetricUpload) -> Result<(), SyncError>;
}

/// Uploads over HTTP with a bearer token.
///
/// `PUT <dashboard>/<destination>/<file_name>?project=<project>`
pub struct HttpUploader {
    client: reqwest::Client,
    dashboard_url: String,
    token: DecryptedSecret,
}

impl HttpUploader {
    pub fn new(
        dashboard_url: &str,
        token: DecryptedSecret,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if !(dashboard_url.starts_with("http://") || dashboard_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_DASHBOARD_URL".to_string(),
                message: format!("'{dashboard_url}' is not an http(s) URL"),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::ParseError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, upload: &MetricUpload) -> String {
        format!(
            "{}/{}/{}",
            self.dashboard_url,
            upload.destination.trim_matches('/'),
            upload.file_name
        )
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, upload: &MetricUpload) -> Result<(), SyncError> {
        let failed = |reason: String| SyncError::Upload {
            project: upload.project.clone(),
            reason,
        };

        let resp = self
            .client
            .put(self.url(upload))
            .query(&[("project", upload.project.as_str())])
            .bearer_auth(self.token.expose())
            .body(upload.contents.clone())
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(failed(format!("dashboard returned {status}: {body}")));
        }
        Ok(())
    }
}
