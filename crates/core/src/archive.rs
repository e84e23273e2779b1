//! Archive trait — the durable, embedding-indexed store of every turn.
//!
//! Every turn appended to any buffer is also written here, keyed by a
//! globally unique record id and indexed by a dense embedding. Records are
//! append-only: never mutated (the lone exception is the denormalized node
//! title, rewritten when a node is retitled), never deleted by the core.
//! Buffers forget; the archive does not.

use crate::error::ArchiveError;
use crate::message::{NodeId, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier for one archived turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One archived turn with its embedding and denormalized node title.
///
/// The timestamp is strictly the turn's production time, not indexing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub record_id: RecordId,
    pub node_id: NodeId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// The owning node's title at the moment of indexing.
    pub node_title: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// A record paired with the similarity score a query assigned it.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: ArchiveRecord,
    pub score: f32,
}

/// Metadata filter applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    /// Restrict to one conversation node.
    pub node_id: Option<NodeId>,
    /// Restrict to a set of roles.
    pub roles: Option<Vec<Role>>,
    /// Only records strictly older than this instant. This is how retrieval
    /// refuses to return turns still sitting in the requesting node's buffer.
    pub max_timestamp: Option<DateTime<Utc>>,
}

impl ArchiveFilter {
    /// Filter that excludes everything at or after the given cutoff.
    pub fn before(cutoff: DateTime<Utc>) -> Self {
        Self {
            max_timestamp: Some(cutoff),
            ..Self::default()
        }
    }
}

/// A deterministic sentence-embedding function.
///
/// Identical inputs must produce identical vectors; the dimension is a fixed
/// property of the implementation. Archives refuse to mix records produced by
/// different embedders within one collection.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model name recorded in the collection metadata.
    fn name(&self) -> &str;

    /// Output vector dimension.
    fn dimensions(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ArchiveError>;
}

/// The archive store trait.
///
/// Implementations are internally thread-safe; callers need no external
/// locking. Durability: records survive restarts. Consistency: a record
/// indexed for turn T may not be visible to queries issued immediately after
/// — readers must tolerate eventual visibility.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Backend name (e.g., "sqlite").
    fn name(&self) -> &str;

    /// Persist one record. Callers on the live chat path treat failures as
    /// best-effort (log and continue); the store itself reports them.
    async fn index(&self, record: ArchiveRecord) -> std::result::Result<(), ArchiveError>;

    /// Nearest-neighbor search under cosine similarity, filtered by metadata,
    /// sorted by descending score.
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &ArchiveFilter,
    ) -> std::result::Result<Vec<ScoredRecord>, ArchiveError>;

    /// All records of one node whose timestamps fall in `[from, to]`,
    /// in chronological order.
    async fn window(
        &self,
        node_id: &NodeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::result::Result<Vec<ArchiveRecord>, ArchiveError>;

    /// Rewrite the denormalized node title on all of a node's records.
    /// Returns the number of records touched.
    async fn update_node_title(
        &self,
        node_id: &NodeId,
        new_title: &str,
    ) -> std::result::Result<u64, ArchiveError>;

    /// Total number of records.
    async fn count(&self) -> std::result::Result<u64, ArchiveError>;

    /// Per-node record counts (node_id → count).
    async fn stats(&self) -> std::result::Result<Vec<(NodeId, u64)>, ArchiveError>;

    /// Drop every record. Operator-only; the core never calls this.
    async fn clear(&self) -> std::result::Result<(), ArchiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_unique() {
        assert_ne!(RecordId::new().0, RecordId::new().0);
    }

    #[test]
    fn filter_before_sets_only_cutoff() {
        let cutoff = Utc::now();
        let filter = ArchiveFilter::before(cutoff);
        assert_eq!(filter.max_timestamp, Some(cutoff));
        assert!(filter.node_id.is_none());
        assert!(filter.roles.is_none());
    }

    #[test]
    fn record_serialization_skips_embedding() {
        let record = ArchiveRecord {
            record_id: RecordId::new(),
            node_id: NodeId::from("n1"),
            role: Role::User,
            text: "hello".into(),
            timestamp: Utc::now(),
            node_title: "New Chat".into(),
            embedding: vec![0.1, 0.2],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("embedding"));
        assert!(json.contains("hello"));
    }
}
