//! Rolling summarizer — folds a node's oldest turns into its running summary.
//!
//! Cadence (with the defaults of start_threshold = 15, interval = 5): the
//! first summary is built when the node has processed 15 messages, then a new
//! one every 5 messages — at counts 15, 20, 25, … Each pass summarizes the 5
//! oldest turns currently in the buffer and merges the result with the prior
//! summary. The pass is side-effect-free on the buffer itself: the turns stay
//! put and may later be evicted by capacity.
//!
//! An LM failure leaves the summary unchanged, but the trigger counter still
//! advances so the next interval gets a fresh attempt. Summarization never
//! aborts the user's turn.

use crate::buffer::SUMMARY_CHUNK;
use crate::node::Node;
use canopy_core::{ChatMessage, Provider, ProviderRequest, Turn};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RollingSummarizer {
    provider: Arc<dyn Provider>,
    model: String,
    start_threshold: u64,
    interval: u64,
    timeout: Duration,
}

impl RollingSummarizer {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        start_threshold: u64,
        interval: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            start_threshold: start_threshold.max(1),
            interval: interval.max(1),
            timeout,
        }
    }

    /// Whether a pass is due at the given message count.
    ///
    /// Requires: the count has reached the start threshold, sits on an
    /// interval boundary, and at least one full interval has elapsed since
    /// the last trigger (successful or not).
    pub fn should_trigger(&self, messages_processed: u64, last_trigger: Option<u64>) -> bool {
        if messages_processed < self.start_threshold {
            return false;
        }
        if (messages_processed - self.start_threshold) % self.interval != 0 {
            return false;
        }
        match last_trigger {
            Some(last) => messages_processed.saturating_sub(last) >= self.interval,
            None => true,
        }
    }

    /// Run a summarization pass on the node if one is due. Errors are
    /// swallowed; the caller's turn always proceeds.
    pub async fn maybe_summarize(&self, node: &Node) {
        // Snapshot under the buffer lock; the LM call happens outside it.
        let (oldest, prior_summary) = {
            let mut buffer = node.buffer().lock().await;
            let processed = buffer.messages_processed();
            if !self.should_trigger(processed, buffer.last_summary_trigger()) {
                return;
            }
            buffer.mark_summary_trigger(processed);

            if buffer.len() < SUMMARY_CHUNK {
                debug!(node_id = %node.id(), "Buffer smaller than summary chunk, skipping pass");
                return;
            }
            (buffer.oldest(SUMMARY_CHUNK), buffer.summary().to_string())
        };

        let prompt = build_summary_prompt(&oldest, &prior_summary);
        let request = ProviderRequest {
            temperature: 0.3,
            max_tokens: Some(500),
            ..ProviderRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
        };

        let result = tokio::time::timeout(self.timeout, self.provider.complete(request)).await;
        match result {
            Ok(Ok(response)) => {
                let summary = response.content.trim().to_string();
                if summary.is_empty() {
                    warn!(node_id = %node.id(), "Summarizer returned empty text, keeping prior summary");
                    return;
                }
                debug!(node_id = %node.id(), chars = summary.len(), "Summary updated");
                node.buffer().lock().await.replace_summary(summary);
            }
            Ok(Err(e)) => {
                warn!(node_id = %node.id(), error = %e, "Summarization failed, keeping prior summary");
            }
            Err(_) => {
                warn!(node_id = %node.id(), "Summarization timed out, keeping prior summary");
            }
        }
    }
}

/// Build the summarization prompt. With a prior summary present, the LM is
/// asked to merge rather than start over.
fn build_summary_prompt(turns: &[Turn], prior_summary: &str) -> String {
    let conversation = turns
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str().to_uppercase(), t.text))
        .collect::<Vec<_>>()
        .join("\n");

    if prior_summary.is_empty() {
        format!(
            "Summarize the following conversation messages in 3-5 sentences. \
             Focus on the main topics, user information and preferences, key facts, \
             and decisions.\n\nMESSAGES:\n{conversation}\n\nSummary:"
        )
    } else {
        format!(
            "You are maintaining a rolling summary of a conversation.\n\n\
             PREVIOUS SUMMARY:\n{prior_summary}\n\n\
             NEW MESSAGES:\n{conversation}\n\n\
             Produce an updated 3-5 sentence summary that merges the previous summary \
             with the new messages, keeping important details and dropping redundancy.\n\n\
             Updated summary:"
        )
    }
}
