//! Turn controller bridging a line-delimited host stream to a persistent
//! conversational session.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ Sandbox                                             │
//! │                                                     │
//! │  stdin ──▶ TurnController ──▶ TurnSession ──────────┼──▶ proxy ──▶ LLM API
//! │              │                   (claude CLI)       │
//! │  stdout ◀────┘ text lines, Error: lines, sentinel   │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! The controller guarantees one sentinel per input line no matter what
//! happens during the turn. A failed turn costs the conversation: the session
//! is dropped and the next turn starts a fresh one.

pub mod claude_cli;
mod session;

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, SessionError};
use crate::protocol::{ERROR_PREFIX, SENTINEL, TurnRequest, neutralize};

pub use claude_cli::{ClaudeCliFactory, ClaudeCliSession};
pub use session::{Segment, SegmentStream, SessionFactory, TurnSession};

/// Lifecycle of the bridge's session slot.
pub enum SessionState {
    /// No session yet, or the last one was discarded after an error.
    Uninitialized,
    Active(Box<dyn TurnSession>),
    /// The backend reported a failed turn. Rebuilt on the next turn.
    Faulted,
}

/// Observable phase of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Active,
    Faulted,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            Self::Uninitialized => SessionPhase::Uninitialized,
            Self::Active(_) => SessionPhase::Active,
            Self::Faulted => SessionPhase::Faulted,
        }
    }
}

/// Owns the session and runs one turn per input line.
pub struct TurnController {
    factory: Arc<dyn SessionFactory>,
    state: SessionState,
    turns: u64,
}

impl TurnController {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            state: SessionState::Uninitialized,
            turns: 0,
        }
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Build a session unless one is already active.
    pub async fn ensure_session(&mut self) -> Result<(), SessionError> {
        match self.state.phase() {
            SessionPhase::Active => return Ok(()),
            SessionPhase::Faulted => tracing::info!("Rebuilding session after backend fault"),
            SessionPhase::Uninitialized => tracing::debug!("Creating session"),
        }
        let session = self.factory.create().await?;
        self.state = SessionState::Active(session);
        Ok(())
    }

    /// The backend failed the turn; keep nothing from this session.
    fn mark_faulted(&mut self) {
        self.state = SessionState::Faulted;
    }

    /// Drop the session after an error so the next turn starts clean.
    fn discard_session(&mut self) {
        self.state = SessionState::Uninitialized;
    }

    /// Send `message` to the session and stream its segments to `out`.
    ///
    /// A failed backend result is written as a diagnostic line and faults the
    /// session. Any other failure is returned for the caller to report.
    pub async fn run_turn<W>(&mut self, message: &str, out: &mut W) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        self.ensure_session().await?;
        let SessionState::Active(session) = &mut self.state else {
            return Err(SessionError::Spawn {
                reason: "session unavailable after creation".to_string(),
            }
            .into());
        };

        let mut stream = session.send(message).await?;
        let mut backend_failure = None;
        while let Some(segment) = stream.next().await {
            match segment? {
                Segment::Text(text) => write_line(out, &neutralize(&text)).await?,
                Segment::Result {
                    is_error: true,
                    detail,
                } => {
                    let detail = detail.unwrap_or_else(|| "backend reported an error".to_string());
                    write_line(out, &neutralize(&format!("{ERROR_PREFIX}{detail}"))).await?;
                    backend_failure = Some(detail);
                    break;
                }
                Segment::Result {
                    is_error: false, ..
                } => break,
            }
        }
        drop(stream);

        if let Some(detail) = backend_failure {
            tracing::warn!(turn = self.turns, detail = %detail, "Backend failed the turn");
            self.mark_faulted();
        }
        Ok(())
    }

    /// Handle one raw input line, always finishing with exactly one sentinel.
    ///
    /// Only failures of the output stream itself are returned.
    pub async fn process_line<W>(&mut self, line: &[u8], out: &mut W) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        self.turns += 1;
        let request = std::str::from_utf8(line)
            .map_err(|e| BridgeError::Protocol(format!("request is not valid UTF-8: {e}")))
            .and_then(TurnRequest::decode);

        let outcome = match request {
            Ok(request) => {
                tracing::info!(turn = self.turns, chars = request.message.len(), "Turn started");
                self.run_turn(&request.message, out).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => tracing::debug!(turn = self.turns, "Turn finished"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(turn = self.turns, error = %e, "Turn failed, discarding session");
                self.discard_session();
                write_line(out, &neutralize(&format!("{ERROR_PREFIX}{e}"))).await?;
            }
        }

        write_line(out, SENTINEL).await?;
        Ok(())
    }

    /// Startup handshake for hosts that wait for an initial sentinel.
    pub async fn announce_ready<W>(&self, out: &mut W) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        write_line(out, "Ready.").await?;
        write_line(out, SENTINEL).await?;
        Ok(())
    }

    /// Process every input line until end-of-stream.
    pub async fn serve<R, W>(&mut self, mut input: R, mut output: W) -> Result<(), BridgeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            self.process_line(line, &mut output).await?;
        }
        tracing::info!(turns = self.turns, "Input closed, bridge exiting");
        Ok(())
    }
}

async fn write_line<W>(out: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
