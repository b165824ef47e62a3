//! Error types for sandbridge.

use std::path::PathBuf;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors raised by a conversational session backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start session: {reason}")]
    Spawn { reason: String },

    #[error("backend failure: {reason}")]
    Backend { reason: String },

    #[error("response stream broke: {reason}")]
    Stream { reason: String },
}

/// Errors that abort a single bridge turn.
///
/// Every variant is recovered at the turn boundary: the host sees one
/// `Error: ...` line followed by the sentinel.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    Protocol(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The host side of stdin/stdout failed. Not recoverable.
    #[error("host stream failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the bridge must stop instead of reporting the error as a turn result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Errors raised while forwarding a request upstream.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream timed out")]
    Timeout,

    #[error("upstream unreachable: {0}")]
    Transport(String),

    #[error("concurrency limiter closed")]
    LimiterClosed,
}

/// Errors raised by the metric synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error at {}: {reason}", path.display())]
    Storage { path: PathBuf, reason: String },

    #[error("upload of '{project}' failed: {reason}")]
    Upload { project: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_surfaces_reason_through_bridge_error() {
        let err: BridgeError = SessionError::Backend {
            reason: "overloaded".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "backend failure: overloaded");
    }

    #[test]
    fn storage_error_names_the_path() {
        let err = SyncError::Storage {
            path: PathBuf::from("/metrics/run.db"),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "storage error at /metrics/run.db: permission denied"
        );
    }
}
