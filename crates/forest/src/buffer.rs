//! Message buffer — bounded FIFO of recent turns for one node.
//!
//! The buffer is the node's short-term memory: the last `max_turns` turns in
//! chronological order, plus a rolling summary string maintained by the
//! summarizer and a monotonic count of every message the node has ever seen.
//! Turns leave the buffer only by capacity eviction; they live on in the
//! archive.

use canopy_core::{ForestError, NodeId, Role, Turn};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// How many of the oldest buffered turns each summarization pass consumes.
pub const SUMMARY_CHUNK: usize = 5;

/// A bounded, ordered sequence of turns with exact FIFO eviction.
///
/// Timestamps within one buffer are strictly increasing: when two appends
/// land on the same clock reading, the later one is nudged forward by a
/// sub-millisecond offset so cutoff comparisons stay unambiguous.
#[derive(Debug)]
pub struct MessageBuffer {
    node_id: NodeId,
    turns: VecDeque<Turn>,
    max_turns: usize,
    summary: String,
    messages_processed: u64,
    last_summary_trigger: Option<u64>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl MessageBuffer {
    /// Create an empty buffer. Capacity is clamped to a minimum of 1.
    pub fn new(node_id: NodeId, max_turns: usize) -> Self {
        Self {
            node_id,
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
            summary: String::new(),
            messages_processed: 0,
            last_summary_trigger: None,
            last_timestamp: None,
        }
    }

    /// Append a new turn stamped with the current time.
    ///
    /// If the buffer was at capacity, the oldest turn is removed and returned.
    /// Eviction is not an error; the only failure is empty text.
    pub fn append(&mut self, role: Role, text: &str) -> Result<Option<Turn>, ForestError> {
        if text.trim().is_empty() {
            return Err(ForestError::EmptyMessage);
        }

        let mut timestamp = Utc::now();
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                timestamp = last + Duration::microseconds(500);
            }
        }
        self.last_timestamp = Some(timestamp);

        let evicted = if self.turns.len() == self.max_turns {
            self.turns.pop_front()
        } else {
            None
        };

        self.turns.push_back(Turn {
            role,
            text: text.to_string(),
            timestamp,
            node_id: self.node_id.clone(),
        });
        self.messages_processed += 1;

        Ok(evicted)
    }

    /// The last `n` turns in chronological order; all turns if `n` is None.
    pub fn recent(&self, n: Option<usize>) -> Vec<Turn> {
        let take = n.unwrap_or(self.turns.len()).min(self.turns.len());
        self.turns
            .iter()
            .skip(self.turns.len() - take)
            .cloned()
            .collect()
    }

    /// The first `n` turns (oldest) in chronological order.
    pub fn oldest(&self, n: usize) -> Vec<Turn> {
        self.turns.iter().take(n).cloned().collect()
    }

    /// Timestamp of the oldest turn still in the buffer. `None` means the
    /// buffer is empty and retrieval should apply no cutoff (+∞ semantics).
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.turns.front().map(|t| t.timestamp)
    }

    /// Replace the running summary. The summarizer is the only caller.
    pub fn replace_summary(&mut self, summary: String) {
        self.summary = summary;
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Total messages ever appended to this buffer.
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }

    /// Message count at which the summarizer last fired (successful or not).
    pub fn last_summary_trigger(&self) -> Option<u64> {
        self.last_summary_trigger
    }

    /// Record that the summarizer fired at the given message count.
    /// Advances even when the LM call later fails.
    pub fn mark_summary_trigger(&mut self, at: u64) {
        self.last_summary_trigger = Some(at);
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}
