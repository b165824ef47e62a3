use std::path::PathBuf;

use crate::config::helpers::{
    optional_env, parse_bool_env, parse_list_env, parse_optional_env, parse_string_env,
};
use crate::error::ConfigError;

/// Turn bridge configuration.
///
/// Everything the sandboxed session needs to reach the LLM backend is here,
/// including the placeholder credential. The real API key is never part of
/// this struct; the proxy swaps it in on the way out.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path or name of the `claude` CLI binary.
    pub claude_bin: String,
    /// Claude model to use (e.g. "sonnet", "opus").
    pub model: String,
    /// Maximum agentic turns per backend call, enforced by the CLI.
    pub max_turns: u32,
    /// Working directory for the session.
    pub workdir: PathBuf,
    /// Base URL of the credential-isolating proxy. When unset the CLI uses its
    /// own default endpoint.
    pub api_base_url: Option<String>,
    /// Placeholder credential handed to the session client.
    pub placeholder_key: String,
    /// Tool patterns to auto-approve via project-level `.claude/settings.json`.
    /// Empty means no settings file is written.
    pub allowed_tools: Vec<String>,
    /// Emit `Ready.` plus one sentinel before reading the first request.
    pub announce_ready: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            claude_bin: "claude".to_string(),
            model: "sonnet".to_string(),
            max_turns: 50,
            workdir: PathBuf::from("/app"),
            api_base_url: None,
            placeholder_key: "sandbox-placeholder".to_string(),
            allowed_tools: Vec::new(),
            announce_ready: false,
        }
    }
}

impl BridgeConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            claude_bin: parse_string_env("CLAUDE_BIN", defaults.claude_bin)?,
            model: parse_string_env("CLAUDE_MODEL", defaults.model)?,
            max_turns: parse_optional_env("CLAUDE_MAX_TURNS", defaults.max_turns)?,
            workdir: optional_env("BRIDGE_WORKDIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.workdir),
            api_base_url: optional_env("ANTHROPIC_BASE_URL")?,
            placeholder_key: parse_string_env("SANDBOX_API_KEY", defaults.placeholder_key)?,
            allowed_tools: parse_list_env("BRIDGE_ALLOWED_TOOLS")?,
            announce_ready: parse_bool_env("BRIDGE_ANNOUNCE_READY", defaults.announce_ready)?,
        })
    }
}
