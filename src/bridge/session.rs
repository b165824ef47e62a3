//! The conversational session seam.
//!
//! The bridge owns exactly one session at a time and talks to it only through
//! [`TurnSession`]. Production uses the Claude CLI backend; tests inject fakes
//! through a [`SessionFactory`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::SessionError;

/// One unit of a streamed backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Assistant text, written to the host verbatim as one line.
    Text(String),
    /// The backend finished the turn.
    Result {
        is_error: bool,
        /// Failure description, or the backend's summary on success.
        detail: Option<String>,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn success() -> Self {
        Self::Result {
            is_error: false,
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::Result {
            is_error: true,
            detail: Some(detail.into()),
        }
    }
}

/// Lazy, finite, single-use sequence of segments for one turn.
pub type SegmentStream = BoxStream<'static, Result<Segment, SessionError>>;

/// A persistent conversation with the backend.
#[async_trait]
pub trait TurnSession: Send {
    /// Send one user message and return the response stream for that turn.
    async fn send(&mut self, message: &str) -> Result<SegmentStream, SessionError>;
}

/// Builds fresh sessions. Called on the first turn and after every fault.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn TurnSession>, SessionError>;
}
