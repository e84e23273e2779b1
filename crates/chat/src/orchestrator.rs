//! Chat orchestrator — runs one conversation turn end to end.
//!
//! Per turn: resolve the node, append + index the user turn, optionally
//! retrieve archive memory, assemble the prompt, stream the LM response to
//! the caller, then append + index the assistant turn, run the summarizer,
//! and (once per node) generate a title.
//!
//! Concurrency: turns on one node are serialized by the node's turn gate;
//! turns on different nodes run in parallel. The buffer mutex is held only
//! for snapshot/append — never across LM I/O. LM concurrency is bounded by a
//! semaphore; exhaustion is reported as a retryable error with no state
//! mutations.

use crate::assembler::{assemble_context, AssemblyInput};
use crate::metrics::TurnMetrics;
use crate::stream_event::ChatStreamEvent;
use canopy_core::{
    Archive, ArchiveRecord, ChatMessage, Embedder, Error, ForestError, NodeId, Provider,
    ProviderError, ProviderRequest, ProviderResponse, RecordId, Result, Role, StreamChunk, Turn,
};
use canopy_forest::{Forest, Node, RollingSummarizer};
use canopy_retrieval::{ContextWindowRetriever, QueryDecomposer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Tuning knobs for the orchestrator, normally derived from `AppConfig`.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub model_primary: String,
    pub model_decomposition: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Deadline applied to every LM call and to each streamed chunk.
    pub lm_timeout: Duration,
    /// Deadline for best-effort archive index writes.
    pub index_timeout: Duration,
    pub summarization_start_threshold: u64,
    pub summarization_interval: u64,
    pub retrieval_window_seconds: f64,
    pub retrieval_top_k: usize,
    pub retrieval_top_k_per_subquery: usize,
    pub retrieval_enabled_default: bool,
    pub max_concurrency: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            model_primary: "llama-3.1-8b-instant".into(),
            model_decomposition: "llama-3.1-8b-instant".into(),
            temperature: 0.7,
            max_tokens: 1000,
            lm_timeout: Duration::from_secs(60),
            index_timeout: Duration::from_secs(5),
            summarization_start_threshold: 15,
            summarization_interval: 5,
            retrieval_window_seconds: 60.0,
            retrieval_top_k: 5,
            retrieval_top_k_per_subquery: 5,
            retrieval_enabled_default: true,
            max_concurrency: 16,
        }
    }
}

/// Result of a completed non-streaming turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub response: String,
    /// The node's new title, when this turn generated one.
    pub title: Option<String>,
    pub metrics: TurnMetrics,
}

pub struct ChatOrchestrator {
    forest: Arc<Forest>,
    provider: Arc<dyn Provider>,
    archive: Arc<dyn Archive>,
    embedder: Arc<dyn Embedder>,
    decomposer: QueryDecomposer,
    retriever: ContextWindowRetriever,
    summarizer: RollingSummarizer,
    options: OrchestratorOptions,
    permits: Arc<Semaphore>,
}

impl ChatOrchestrator {
    pub fn new(
        forest: Arc<Forest>,
        provider: Arc<dyn Provider>,
        archive: Arc<dyn Archive>,
        embedder: Arc<dyn Embedder>,
        options: OrchestratorOptions,
    ) -> Arc<Self> {
        let decomposer = QueryDecomposer::new(
            provider.clone(),
            options.model_decomposition.clone(),
            options.lm_timeout,
        );
        let retriever = ContextWindowRetriever::new(
            archive.clone(),
            embedder.clone(),
            options.retrieval_window_seconds,
            options.retrieval_top_k,
            options.retrieval_top_k_per_subquery,
        );
        let summarizer = RollingSummarizer::new(
            provider.clone(),
            options.model_primary.clone(),
            options.summarization_start_threshold,
            options.summarization_interval,
            options.lm_timeout,
        );
        let permits = Arc::new(Semaphore::new(options.max_concurrency.max(1)));

        Arc::new(Self {
            forest,
            provider,
            archive,
            embedder,
            decomposer,
            retriever,
            summarizer,
            options,
            permits,
        })
    }

    pub fn forest(&self) -> &Arc<Forest> {
        &self.forest
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    /// Run a complete (non-streaming) turn.
    pub async fn send_message(
        &self,
        node_id: &NodeId,
        text: &str,
        disable_rag: bool,
    ) -> Result<TurnOutcome> {
        let start = Instant::now();
        let node = self.forest.get(node_id).await?;
        if text.trim().is_empty() {
            return Err(ForestError::EmptyMessage.into());
        }
        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::PoolExhausted { retry_after_secs: 2 })?;
        let _gate = node.lock_turn().await;

        let (messages, mut metrics) = self.prepare_turn(&node, text, disable_rag).await?;

        let response = self.complete_with_retry(messages).await?;
        if let Some(usage) = response.usage {
            metrics.prompt_tokens = usage.prompt_tokens;
            metrics.completion_tokens = usage.completion_tokens;
        }

        let title = self.finish_turn(&node, text, &response.content).await;
        metrics.set_latency(start.elapsed());
        metrics.emit(node_id);

        Ok(TurnOutcome {
            response: response.content,
            title,
            metrics,
        })
    }

    /// Start a streaming turn. The returned receiver yields `Token` frames
    /// followed by an optional `Title` and a terminal `Done` — or a terminal
    /// `Error`. Dropping the receiver cancels the turn: the LM stream is
    /// abandoned and no partial assistant turn is persisted.
    pub async fn send_message_stream(
        self: Arc<Self>,
        node_id: &NodeId,
        text: &str,
        disable_rag: bool,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>> {
        let node = self.forest.get(node_id).await?;
        if text.trim().is_empty() {
            return Err(ForestError::EmptyMessage.into());
        }
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::PoolExhausted { retry_after_secs: 2 })?;
        let gate = node.lock_turn().await;

        let (tx, rx) = mpsc::channel(64);
        let orchestrator = self;
        let text = text.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            let _gate = gate;
            orchestrator
                .run_streaming_turn(node, text, disable_rag, tx)
                .await;
        });

        Ok(rx)
    }

    async fn run_streaming_turn(
        &self,
        node: Arc<Node>,
        text: String,
        disable_rag: bool,
        tx: mpsc::Sender<ChatStreamEvent>,
    ) {
        let start = Instant::now();

        let (messages, mut metrics) = match self.prepare_turn(&node, &text, disable_rag).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = tx
                    .send(ChatStreamEvent::Error {
                        content: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut lm_rx = match self.open_stream_with_retry(messages).await {
            Ok(rx) => rx,
            Err(e) => {
                // The user turn stays in the buffer so a client retry has
                // context.
                let _ = tx
                    .send(ChatStreamEvent::Error {
                        content: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut assistant_text = String::new();
        loop {
            let chunk = match tokio::time::timeout(self.options.lm_timeout, lm_rx.recv()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    let _ = tx
                        .send(ChatStreamEvent::Error {
                            content: e.to_string(),
                        })
                        .await;
                    return;
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = tx
                        .send(ChatStreamEvent::Error {
                            content: "LM stream timed out".into(),
                        })
                        .await;
                    return;
                }
            };

            if let Some(delta) = chunk.content {
                if !delta.is_empty() {
                    metrics.set_first_token(start.elapsed());
                    assistant_text.push_str(&delta);
                    if tx
                        .send(ChatStreamEvent::Token { content: delta })
                        .await
                        .is_err()
                    {
                        // Client disconnected. Drop the LM stream and discard
                        // the partial assistant text — nothing is persisted.
                        debug!(node_id = %node.id(), "Client disconnected mid-stream, discarding partial turn");
                        return;
                    }
                }
            }
            if chunk.done {
                if let Some(usage) = chunk.usage {
                    metrics.prompt_tokens = usage.prompt_tokens;
                    metrics.completion_tokens = usage.completion_tokens;
                }
                break;
            }
        }

        let title = self.finish_turn(&node, &text, &assistant_text).await;
        if let Some(title) = title {
            let _ = tx.send(ChatStreamEvent::Title { content: title }).await;
        }
        metrics.set_latency(start.elapsed());
        metrics.emit(node.id());
        let _ = tx.send(ChatStreamEvent::Done).await;
    }

    /// Append + index the user turn, run retrieval if enabled, and assemble
    /// the prompt. Caller holds the node's turn gate.
    async fn prepare_turn(
        &self,
        node: &Arc<Node>,
        text: &str,
        disable_rag: bool,
    ) -> Result<(Vec<ChatMessage>, TurnMetrics)> {
        // Snapshot and append under one short lock. The cutoff is computed
        // after the append so a turn evicted right now becomes retrievable.
        let (user_turn, prior_turns, cutoff) = {
            let mut buffer = node.buffer().lock().await;
            buffer.append(Role::User, text).map_err(Error::Forest)?;
            let mut all = buffer.recent(None);
            let user_turn = all.pop().expect("buffer cannot be empty after append");
            (user_turn, all, buffer.oldest_timestamp())
        };

        self.index_turn(node, &user_turn).await;
        self.summarizer.maybe_summarize(node).await;

        let retrieval_enabled = !disable_rag && self.options.retrieval_enabled_default;
        let retrieved = if retrieval_enabled {
            let decomposed = self.decomposer.decompose(text).await;
            self.retriever
                .retrieve(&decomposed.sub_queries, cutoff)
                .await
        } else {
            Vec::new()
        };

        let summary = node.buffer().lock().await.summary().to_string();
        let messages = assemble_context(&AssemblyInput {
            follow_up_prompt: node.enhanced_follow_up_prompt(),
            summary: &summary,
            retrieved: &retrieved,
            buffer_turns: &prior_turns,
            user_message: text,
        });

        let metrics = TurnMetrics {
            retrieval_ran: retrieval_enabled,
            records_retrieved: retrieved.len(),
            ..Default::default()
        };
        Ok((messages, metrics))
    }

    /// Append + index the assistant turn, run the summarizer, and generate a
    /// title if this node still has its default one. Returns the new title.
    async fn finish_turn(
        &self,
        node: &Arc<Node>,
        user_text: &str,
        assistant_text: &str,
    ) -> Option<String> {
        if !assistant_text.trim().is_empty() {
            let assistant_turn = {
                let mut buffer = node.buffer().lock().await;
                match buffer.append(Role::Assistant, assistant_text) {
                    Ok(_) => buffer.recent(Some(1)).pop(),
                    Err(e) => {
                        warn!(node_id = %node.id(), error = %e, "Assistant append failed");
                        None
                    }
                }
            };
            if let Some(turn) = assistant_turn {
                self.index_turn(node, &turn).await;
            }
        }

        self.summarizer.maybe_summarize(node).await;
        self.maybe_generate_title(node, user_text).await
    }

    /// Best-effort archive write. Failures are logged, never propagated —
    /// a broken index must not break the live chat turn.
    async fn index_turn(&self, node: &Node, turn: &Turn) {
        let embedding = match self.embedder.embed(&turn.text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(node_id = %turn.node_id, error = %e, "Embedding failed, record not archived");
                return;
            }
        };

        let record = ArchiveRecord {
            record_id: RecordId::new(),
            node_id: turn.node_id.clone(),
            role: turn.role,
            text: turn.text.clone(),
            timestamp: turn.timestamp,
            node_title: node.title().await,
            embedding,
        };

        match tokio::time::timeout(self.options.index_timeout, self.archive.index(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(node_id = %turn.node_id, error = %e, "Archive index failed"),
            Err(_) => warn!(node_id = %turn.node_id, "Archive index timed out"),
        }
    }

    /// Generate a title once per node, after its first completed assistant
    /// turn. The LM attempt falls back to keyword extraction, so the default
    /// title is always replaced and later turns never retitle. The new title
    /// is propagated to the node's already-archived records.
    async fn maybe_generate_title(&self, node: &Arc<Node>, user_text: &str) -> Option<String> {
        if !node.has_default_title().await {
            return None;
        }

        let title = self.generate_title(user_text).await;
        node.set_title(title.clone()).await;

        match tokio::time::timeout(
            self.options.index_timeout,
            self.archive.update_node_title(node.id(), &title),
        )
        .await
        {
            Ok(Ok(updated)) => {
                debug!(node_id = %node.id(), title = %title, records = updated, "Title propagated to archive")
            }
            Ok(Err(e)) => warn!(node_id = %node.id(), error = %e, "Archive title update failed"),
            Err(_) => warn!(node_id = %node.id(), "Archive title update timed out"),
        }

        Some(title)
    }

    async fn generate_title(&self, question: &str) -> String {
        let request = ProviderRequest {
            temperature: 0.3,
            max_tokens: Some(20),
            ..ProviderRequest::new(
                self.options.model_primary.clone(),
                vec![
                    ChatMessage::system(
                        "You are a title generator. Generate short, descriptive titles for \
                         conversations. Respond only with the title, no quotes or extra formatting.",
                    ),
                    ChatMessage::user(format!(
                        "Generate a short, descriptive title (maximum 4 words) for a conversation \
                         that starts with this question: '{question}'. Only respond with the \
                         title, no quotes or extra text."
                    )),
                ],
            )
        };

        match tokio::time::timeout(self.options.lm_timeout, self.provider.complete(request)).await
        {
            Ok(Ok(response)) => {
                let title = response
                    .content
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .trim()
                    .to_string();
                if !title.is_empty() && title.len() <= 50 {
                    title
                } else {
                    fallback_title(question)
                }
            }
            _ => fallback_title(question),
        }
    }

    /// Chat completion with one retry (short backoff) on transient errors.
    async fn complete_with_retry(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<ProviderResponse> {
        let request = ProviderRequest {
            temperature: self.options.temperature,
            max_tokens: Some(self.options.max_tokens),
            ..ProviderRequest::new(self.options.model_primary.clone(), messages)
        };

        let mut last_error: Option<ProviderError> = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match tokio::time::timeout(
                self.options.lm_timeout,
                self.provider.complete(request.clone()),
            )
            .await
            {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_transient() => {
                    warn!(attempt, error = %e, "Transient LM error");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(attempt, "LM completion deadline exceeded");
                    last_error = Some(ProviderError::Timeout("completion deadline".into()));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ProviderError::Network("retry bookkeeping".into()))
            .into())
    }

    /// Open the LM stream, retrying once on transient pre-stream errors.
    /// Mid-stream failures are not retried — tokens already went out.
    async fn open_stream_with_retry(
        &self,
        messages: Vec<ChatMessage>,
    ) -> std::result::Result<
        mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let request = ProviderRequest {
            temperature: self.options.temperature,
            max_tokens: Some(self.options.max_tokens),
            stream: true,
            ..ProviderRequest::new(self.options.model_primary.clone(), messages)
        };

        let mut last_error: Option<ProviderError> = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match tokio::time::timeout(
                self.options.lm_timeout,
                self.provider.stream(request.clone()),
            )
            .await
            {
                Ok(Ok(rx)) => return Ok(rx),
                Ok(Err(e)) if e.is_transient() => {
                    warn!(attempt, error = %e, "Transient LM stream-open error");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(attempt, "LM stream-open deadline exceeded");
                    last_error = Some(ProviderError::Timeout("stream-open deadline".into()));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProviderError::Network("retry bookkeeping".into())))
    }
}

/// Keyword-extraction fallback for title generation: the first three
/// meaningful words of the question, title-cased.
fn fallback_title(question: &str) -> String {
    const SKIP: &[&str] = &[
        "what", "how", "why", "when", "where", "who", "which", "can", "you", "tell", "me",
        "about", "explain", "describe", "is", "are", "the", "a", "an", "do", "does", "will",
    ];

    let cleaned = question.to_lowercase().replace(['?', '.', '!', ','], " ");
    let words: Vec<String> = cleaned
        .split_whitespace()
        .filter(|w| w.len() > 2 && !SKIP.contains(w))
        .take(3)
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    if words.is_empty() {
        let truncated: String = question.chars().take(25).collect();
        if question.chars().count() > 25 {
            format!("{truncated}...")
        } else {
            truncated
        }
    } else {
        words.join(" ")
    }
}
