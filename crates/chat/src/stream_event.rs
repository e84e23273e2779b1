//! Turn-level streaming events.
//!
//! `ChatStreamEvent` is the channel protocol between the orchestrator and the
//! HTTP layer; the gateway serializes each event as one SSE `data:` frame.
//!
//! - `token` — next response delta; zero or more per turn
//! - `title` — at most once per turn, when the node was just retitled
//! - `done`  — terminal, normal completion
//! - `error` — terminal, failure (no `done` follows)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// Partial response text from the LM.
    Token { content: String },

    /// The node's title changed during this turn.
    Title { content: String },

    /// The stream completed normally.
    Done,

    /// The stream failed; no `Done` follows.
    Error { content: String },
}

impl ChatStreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Title { .. } => "title",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}
