pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::model::Citation;

// Re-export common types
pub use stream::{EventEmitter, EventStream, Lagged, Subscription};

/// Event payloads, discriminated by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Thinking {
        message: String,
    },
    ToolCall {
        tool: String,
        args: Value,
    },
    ToolResult {
        tool: String,
        output: Value,
    },
    Screenshot {
        #[serde(rename = "ref")]
        reference: String,
    },
    Complete {
        answer: String,
        citations: Vec<Citation>,
        screenshots: Vec<String>,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

impl EventKind {
    /// `complete` and non-recoverable `error` close the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete { .. } | EventKind::Error { recoverable: false, .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Thinking { .. } => "thinking",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::Screenshot { .. } => "screenshot",
            EventKind::Complete { .. } => "complete",
            EventKind::Error { .. } => "error",
        }
    }
}

/// An appended, immutable event: `{type, ts, seq, ...}` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}
