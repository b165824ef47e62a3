//! Turn sentinel line protocol.
//!
//! ```text
//! host                          bridge
//!  │  {"message": "hello"}\n      │
//!  │ ───────────────────────────▶ │
//!  │                 Hi\n         │
//!  │                  there\n     │
//!  │           ---END_TURN---\n   │
//!  │ ◀─────────────────────────── │
//! ```
//!
//! One JSON object per request line, any number of plain text lines back,
//! then exactly one sentinel line. The host must not send the next request
//! before it has read the sentinel.
//!
//! Response text may span several lines. The sentinel never appears inside
//! it: the bridge rewrites any embedded occurrence to [`ESCAPED_SENTINEL`].

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::BridgeError;

/// Marks the end of a turn on the output stream.
pub const SENTINEL: &str = "---END_TURN---";

/// What an embedded sentinel in response text is rewritten to.
pub const ESCAPED_SENTINEL: &str = "---END-TURN---";

/// Prefix of diagnostic lines.
pub const ERROR_PREFIX: &str = "Error: ";

/// A single decoded request line. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,
}

impl TurnRequest {
    /// Decode one input line.
    pub fn decode(line: &str) -> Result<Self, BridgeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(BridgeError::Protocol("empty request line".to_string()));
        }
        serde_json::from_str(line).map_err(|e| BridgeError::Protocol(e.to_string()))
    }
}

/// Encode a request as a single newline-terminated line.
pub fn encode_request(message: &str) -> String {
    let mut line = serde_json::json!({ "message": message }).to_string();
    line.push('\n');
    line
}

/// Rewrite embedded sentinels so `text` cannot end a turn early.
pub fn neutralize(text: &str) -> Cow<'_, str> {
    if text.contains(SENTINEL) {
        Cow::Owned(text.replace(SENTINEL, ESCAPED_SENTINEL))
    } else {
        Cow::Borrowed(text)
    }
}

/// Everything the bridge wrote for one turn, sentinel excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnResponse {
    pub lines: Vec<String>,
}

impl TurnResponse {
    /// Response lines joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Diagnostic lines, without the `Error: ` prefix.
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter_map(|l| l.strip_prefix(ERROR_PREFIX))
    }

    pub fn is_error(&self) -> bool {
        self.errors().next().is_some()
    }
}

/// Read one turn from the bridge's output.
///
/// Returns `Ok(None)` when the stream ends before a sentinel arrives. A line
/// that ends with the sentinel contributes its prefix, if non-empty.
pub async fn read_turn<R>(reader: &mut R) -> std::io::Result<Option<TurnResponse>>
where
    R: AsyncBufRead + Unpin,
{
    let mut response = TurnResponse::default();
    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            return Ok(None);
        }
        let line = buf.trim_end_matches(['\n', '\r']);
        if let Some(idx) = line.find(SENTINEL) {
            let prefix = &line[..idx];
            if !prefix.trim().is_empty() {
                response.lines.push(prefix.to_string());
            }
            return Ok(Some(response));
        }
        response.lines.push(line.to_string());
    }
}
