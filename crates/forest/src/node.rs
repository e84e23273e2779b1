//! Tree node — one conversation branch.
//!
//! A node has an immutable identity and follow-up record, a mutable title,
//! exclusive ownership of one buffer, and relation-only links to its parent
//! and children. Parent links are ids resolved through the `Forest` registry,
//! never aliased pointers, which keeps ownership acyclic.

use crate::buffer::MessageBuffer;
use canopy_core::{ContextType, FollowUp, NodeId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Title given to nodes created without an explicit one. Title generation
/// replaces it after the first completed assistant turn.
pub const DEFAULT_TITLE: &str = "New Chat";

/// One conversation branch.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    created_at: DateTime<Utc>,
    parent: Option<NodeId>,
    follow_up: Option<FollowUp>,
    title: RwLock<String>,
    children: RwLock<Vec<NodeId>>,
    /// Protects the buffer. Critical sections span snapshot/append only,
    /// never an LM call.
    buffer: Mutex<MessageBuffer>,
    /// Serializes whole turns on this node so turn N's assistant message is
    /// appended before turn N+1's user message.
    turn_gate: Arc<Mutex<()>>,
}

impl Node {
    pub fn new(
        title: Option<String>,
        parent: Option<NodeId>,
        follow_up: Option<FollowUp>,
        max_turns: usize,
    ) -> Self {
        let id = NodeId::new();
        Self {
            buffer: Mutex::new(MessageBuffer::new(id.clone(), max_turns)),
            id,
            created_at: Utc::now(),
            parent,
            follow_up,
            title: RwLock::new(title.unwrap_or_else(|| DEFAULT_TITLE.to_string())),
            children: RwLock::new(Vec::new()),
            turn_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn follow_up(&self) -> Option<&FollowUp> {
        self.follow_up.as_ref()
    }

    pub fn buffer(&self) -> &Mutex<MessageBuffer> {
        &self.buffer
    }

    /// Acquire the whole-turn serialization lock. The orchestrator holds the
    /// guard for the duration of one turn; buffer access still goes through
    /// `buffer()`. Waiters acquire in arrival order.
    pub async fn lock_turn(&self) -> OwnedMutexGuard<()> {
        self.turn_gate.clone().lock_owned().await
    }

    pub async fn title(&self) -> String {
        self.title.read().await.clone()
    }

    pub async fn set_title(&self, title: String) {
        *self.title.write().await = title;
    }

    /// Whether the title is still the creation-time default.
    pub async fn has_default_title(&self) -> bool {
        *self.title.read().await == DEFAULT_TITLE
    }

    pub async fn children(&self) -> Vec<NodeId> {
        self.children.read().await.clone()
    }

    pub(crate) async fn push_child(&self, child: NodeId) {
        self.children.write().await.push(child);
    }

    pub(crate) async fn remove_child(&self, child: &NodeId) {
        self.children.write().await.retain(|c| c != child);
    }

    /// Compose the single system line that carries parent semantics into this
    /// node's prompt. This is the ONLY way parent content reaches a child.
    ///
    /// Returns `None` for roots and for subchats that are not follow-ups.
    pub fn enhanced_follow_up_prompt(&self) -> Option<String> {
        let follow_up = self.follow_up.as_ref()?;
        if follow_up.context_type != ContextType::FollowUp {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(selected) = follow_up
            .selected_text
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            parts.push(format!(
                "Follow-up context: the user selected \"{selected}\" from the parent conversation."
            ));
        }
        if let Some(context) = follow_up
            .follow_up_context
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            parts.push(format!("Focus narrowly on: {context}."));
        } else if !parts.is_empty() {
            parts.push("Focus your response narrowly on that selection.".to_string());
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}
