//! Per-turn metrics.
//!
//! Not persisted; surfaced through logs and returned to non-streaming
//! callers so tests and operators can see what a turn cost.

use canopy_core::NodeId;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnMetrics {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Milliseconds from turn start to the first LM token. `None` when the
    /// stream produced no tokens.
    pub time_to_first_token_ms: Option<u64>,
    /// Milliseconds from turn start to completion.
    pub total_latency_ms: u64,
    pub retrieval_ran: bool,
    pub records_retrieved: usize,
}

impl TurnMetrics {
    pub fn set_latency(&mut self, total: Duration) {
        self.total_latency_ms = total.as_millis() as u64;
    }

    pub fn set_first_token(&mut self, elapsed: Duration) {
        if self.time_to_first_token_ms.is_none() {
            self.time_to_first_token_ms = Some(elapsed.as_millis() as u64);
        }
    }

    /// Emit the metrics as one structured log line.
    pub fn emit(&self, node_id: &NodeId) {
        tracing::info!(
            node_id = %node_id,
            prompt_tokens = self.prompt_tokens,
            completion_tokens = self.completion_tokens,
            time_to_first_token_ms = self.time_to_first_token_ms,
            total_latency_ms = self.total_latency_ms,
            retrieval_ran = self.retrieval_ran,
            records_retrieved = self.records_retrieved,
            "Turn complete"
        );
    }
}
