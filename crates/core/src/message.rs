//! Message and turn domain types.
//!
//! These are the core value objects that flow through the system: a user
//! submits text → the node's buffer records a `Turn` → the assembler builds
//! `ChatMessage`s for the provider → both sides of the exchange land in the
//! archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation node (one branch of a tree).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions (follow-up link, summary, archive block)
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Parse a stored role string. Unknown strings are rejected.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single turn held in a node's buffer.
///
/// The timestamp is the turn's production time, stamped once on append and
/// reused verbatim when the turn is archived, so buffer-exclusion cutoffs
/// compare like with like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub node_id: NodeId,
}

/// A message in provider wire format (no buffer bookkeeping attached).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Why a subchat was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// The user selected text in the parent and branched off to dig into it.
    FollowUp,
    /// A fresh topic that happens to live under this parent.
    NewTopic,
    #[default]
    General,
}

/// The follow-up record stored on a child node at creation time.
///
/// This is the ONLY parent-to-child content leak the system permits: a short
/// fragment the user selected plus a statement of what they want from it.
/// The parent's buffer is never copied, referenced, or inherited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowUp {
    /// Text the user selected from the parent conversation.
    pub selected_text: Option<String>,
    /// What the user wants to explore about the selection.
    pub follow_up_context: Option<String>,
    /// Kind of subchat this is.
    pub context_type: ContextType,
}
