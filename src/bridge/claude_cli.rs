//! Claude CLI session backend.
//!
//! Each turn spawns `claude -p <message> --output-format stream-json` and
//! turns its NDJSON output into [`Segment`]s. The session id captured from the
//! `system` init event is passed back with `--resume` on later turns, so the
//! conversation persists across turns for as long as this session lives.
//!
//! The CLI reaches the LLM API through the credential-isolating proxy: the
//! child gets `ANTHROPIC_BASE_URL` and a placeholder `ANTHROPIC_API_KEY`
//! through `Command::envs`, never through this process's own environment.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::bridge::session::{Segment, SegmentStream, SessionFactory, TurnSession};
use crate::config::BridgeConfig;
use crate::error::SessionError;

/// How long a new turn waits for the previous turn's CLI process to exit.
const PREVIOUS_TURN_GRACE: Duration = Duration::from_secs(30);

/// A Claude Code streaming event (NDJSON line from `--output-format stream-json`).
///
/// Claude Code emits one JSON object per line with these top-level types:
///
///   system    -> session init (session_id, tools, model)
///   assistant -> LLM response, nested under message.content[] as text/tool_use blocks
///   user      -> tool results, nested under message.content[] as tool_result blocks
///   result    -> final summary (is_error, subtype, result text)
///
/// Content blocks live under `message.content`, NOT at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeStreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub subtype: Option<String>,

    #[serde(default)]
    pub message: Option<MessageWrapper>,

    /// For `result` events: the final text output.
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWrapper {
    #[serde(default)]
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Map one stream event onto the segments the bridge writes.
///
/// Tool traffic and init events carry nothing for the host and map to nothing.
fn event_to_segments(event: &ClaudeStreamEvent) -> Vec<Segment> {
    match event.event_type.as_str() {
        "assistant" => event
            .message
            .as_ref()
            .and_then(|m| m.content.as_ref())
            .into_iter()
            .flatten()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .filter(|text| !text.is_empty())
            .map(Segment::text)
            .collect(),
        "result" => {
            let is_error = event.is_error.unwrap_or(false);
            let text = event
                .result
                .as_ref()
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty())
                .map(String::from);
            // Success text repeats what the assistant events already streamed.
            let detail = if is_error {
                text.or_else(|| event.subtype.clone())
            } else {
                None
            };
            vec![Segment::Result { is_error, detail }]
        }
        _ => Vec::new(),
    }
}

/// Build the JSON content for `.claude/settings.json` with the given tool allowlist.
fn build_permission_settings(allowed_tools: &[String]) -> Result<String, SessionError> {
    let settings = serde_json::json!({
        "permissions": {
            "allow": allowed_tools,
        }
    });
    serde_json::to_string_pretty(&settings).map_err(|e| SessionError::Spawn {
        reason: format!("failed to render settings.json: {e}"),
    })
}

async fn write_permission_settings(
    workdir: &Path,
    allowed_tools: &[String],
) -> Result<(), SessionError> {
    let settings_json = build_permission_settings(allowed_tools)?;
    let settings_dir = workdir.join(".claude");
    tokio::fs::create_dir_all(&settings_dir)
        .await
        .map_err(|e| SessionError::Spawn {
            reason: format!("failed to create {}: {e}", settings_dir.display()),
        })?;
    tokio::fs::write(settings_dir.join("settings.json"), settings_json)
        .await
        .map_err(|e| SessionError::Spawn {
            reason: format!("failed to write settings.json: {e}"),
        })?;
    tracing::info!(tools = ?allowed_tools, "Wrote Claude Code permission settings");
    Ok(())
}

/// Builds [`ClaudeCliSession`]s from bridge configuration.
pub struct ClaudeCliFactory {
    config: BridgeConfig,
}

impl ClaudeCliFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ClaudeCliFactory {
    async fn create(&self) -> Result<Box<dyn TurnSession>, SessionError> {
        if !self.config.allowed_tools.is_empty() {
            write_permission_settings(&self.config.workdir, &self.config.allowed_tools).await?;
        }
        Ok(Box::new(ClaudeCliSession::new(self.config.clone())))
    }
}

/// A conversation backed by the Claude CLI.
pub struct ClaudeCliSession {
    config: BridgeConfig,
    child_env: HashMap<String, String>,
    /// Written by the stdout reader task when the init event arrives.
    session_id: Arc<Mutex<Option<String>>>,
    /// Reader task of the last turn; it finishes once that child has exited.
    previous_turn: Option<JoinHandle<()>>,
}

impl ClaudeCliSession {
    pub fn new(config: BridgeConfig) -> Self {
        let mut child_env = HashMap::new();
        child_env.insert(
            "ANTHROPIC_API_KEY".to_string(),
            config.placeholder_key.clone(),
        );
        if let Some(ref url) = config.api_base_url {
            child_env.insert("ANTHROPIC_BASE_URL".to_string(), url.clone());
        }
        Self {
            config,
            child_env,
            session_id: Arc::new(Mutex::new(None)),
            previous_turn: None,
        }
    }

    fn resume_id(&self) -> Option<String> {
        match self.session_id.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn command(&self, message: &str) -> Command {
        let mut cmd = Command::new(&self.config.claude_bin);
        cmd.arg("-p")
            .arg(message)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(self.config.max_turns.to_string())
            .arg("--model")
            .arg(&self.config.model);

        if let Some(sid) = self.resume_id() {
            cmd.arg("--resume").arg(sid);
        }

        cmd.envs(&self.child_env)
            .current_dir(&self.config.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Make sure no earlier CLI process is still writing to the same session.
    async fn settle_previous_turn(&mut self) {
        let Some(mut previous) = self.previous_turn.take() else {
            return;
        };
        if tokio::time::timeout(PREVIOUS_TURN_GRACE, &mut previous)
            .await
            .is_err()
        {
            tracing::warn!("Previous claude process still running, killing it");
            // Dropping the task drops its child, and kill_on_drop stops it.
            previous.abort();
            let _ = previous.await;
        }
    }
}

#[async_trait]
impl TurnSession for ClaudeCliSession {
    async fn send(&mut self, message: &str) -> Result<SegmentStream, SessionError> {
        self.settle_previous_turn().await;

        let mut child = self.command(message).spawn().map_err(|e| SessionError::Spawn {
            reason: format!("failed to spawn {}: {e}", self.config.claude_bin),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| SessionError::Spawn {
            reason: "failed to capture claude stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SessionError::Spawn {
            reason: "failed to capture claude stderr".to_string(),
        })?;

        // Keep the last stderr line to explain a crash without a result event.
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("claude stderr: {}", line);
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            last
        });

        let (tx, rx) = mpsc::channel(64);
        let session_id = Arc::clone(&self.session_id);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;
            // Cleared when the bridge drops the stream; output is then drained
            // so the child can run to completion and be reaped.
            let mut listening = true;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(SessionError::Stream {
                                reason: format!("failed reading claude output: {e}"),
                            }))
                            .await;
                        return;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let event = match serde_json::from_str::<ClaudeStreamEvent>(line) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!("Non-JSON claude output: {} (parse error: {})", line, e);
                        continue;
                    }
                };

                if event.event_type == "system"
                    && let Some(ref sid) = event.session_id
                {
                    tracing::info!(session_id = %sid, "Captured Claude session ID");
                    match session_id.lock() {
                        Ok(mut guard) => *guard = Some(sid.clone()),
                        Err(poisoned) => *poisoned.into_inner() = Some(sid.clone()),
                    }
                }

                for segment in event_to_segments(&event) {
                    saw_result |= matches!(segment, Segment::Result { .. });
                    if listening && tx.send(Ok(segment)).await.is_err() {
                        listening = false;
                    }
                }
            }

            let status = child.wait().await;
            let last_stderr = stderr_handle.await.ok().flatten();
            if saw_result || !listening {
                return;
            }
            let reason = match status {
                Ok(status) if status.success() => {
                    "claude exited without a result event".to_string()
                }
                Ok(status) => format!(
                    "claude exited with code {}{}",
                    status.code().unwrap_or(-1),
                    last_stderr.map(|l| format!(": {l}")).unwrap_or_default()
                ),
                Err(e) => format!("failed waiting for claude: {e}"),
            };
            let _ = tx.send(Err(SessionError::Stream { reason })).await;
        });

        self.previous_turn = Some(reader);
        Ok(ReceiverStream::new(rx).boxed())
    }
}
