//! Context window retriever.
//!
//! Single archived messages lack context: "yes, that works" is useless
//! without the question it answered. For each ranked hit the retriever pulls
//! the hit's temporal neighborhood — every record from the same node within
//! ±W seconds — and emits it chronologically.
//!
//! The buffer cutoff keeps retrieval honest: records at or after the
//! requesting node's oldest buffered timestamp are excluded, because the
//! buffer already supplies them verbatim. Cross-conversation hits are
//! intentional; isolation is enforced at prompt-assembly time by labeling,
//! not here by filtering.

use canopy_core::{Archive, ArchiveFilter, ArchiveRecord, Embedder, RecordId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ContextWindowRetriever {
    archive: Arc<dyn Archive>,
    embedder: Arc<dyn Embedder>,
    /// Half-width of the temporal window around each hit.
    window: Duration,
    /// Number of hits whose windows are expanded.
    top_k: usize,
    /// Results requested from the archive per sub-query.
    top_k_per_subquery: usize,
}

impl ContextWindowRetriever {
    pub fn new(
        archive: Arc<dyn Archive>,
        embedder: Arc<dyn Embedder>,
        window_seconds: f64,
        top_k: usize,
        top_k_per_subquery: usize,
    ) -> Self {
        Self {
            archive,
            embedder,
            window: Duration::microseconds((window_seconds.max(0.0) * 1_000_000.0) as i64),
            top_k: top_k.max(1),
            top_k_per_subquery: top_k_per_subquery.max(1),
        }
    }

    /// Run all sub-queries against the archive and return an ordered,
    /// deduplicated record list: best-scoring hits first, each expanded into
    /// its chronological ±W window.
    ///
    /// `cutoff` is the requesting node's oldest buffered timestamp; `None`
    /// means the buffer is empty and nothing is excluded. Failures on a
    /// single sub-query are isolated — the result is the union of the
    /// successful ones.
    pub async fn retrieve(
        &self,
        sub_queries: &[String],
        cutoff: Option<DateTime<Utc>>,
    ) -> Vec<ArchiveRecord> {
        let filter = ArchiveFilter {
            max_timestamp: cutoff,
            ..Default::default()
        };

        // Per-record max score across all sub-queries.
        let mut merged: HashMap<RecordId, (f32, ArchiveRecord)> = HashMap::new();
        for sub_query in sub_queries {
            let embedding = match self.embedder.embed(sub_query).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(sub_query, error = %e, "Embedding failed, skipping sub-query");
                    continue;
                }
            };

            let hits = match self
                .archive
                .query(&embedding, self.top_k_per_subquery, &filter)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(sub_query, error = %e, "Archive query failed, skipping sub-query");
                    continue;
                }
            };

            for hit in hits {
                merged
                    .entry(hit.record.record_id.clone())
                    .and_modify(|(score, _)| *score = score.max(hit.score))
                    .or_insert((hit.score, hit.record));
            }
        }

        // Rank hits: score descending, ties by timestamp then record id for a
        // stable order.
        let mut hits: Vec<(f32, ArchiveRecord)> = merged.into_values().collect();
        hits.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.timestamp.cmp(&b.1.timestamp))
                .then_with(|| a.1.record_id.cmp(&b.1.record_id))
        });

        // Expand the top hits into their temporal windows. The hit budget —
        // not the emitted record count — bounds the loop, so widening the
        // window can only ever add records.
        let mut emitted: HashSet<RecordId> = HashSet::new();
        let mut results: Vec<ArchiveRecord> = Vec::new();

        for (_score, hit) in hits.into_iter().take(self.top_k) {
            let from = hit.timestamp - self.window;
            let to = hit.timestamp + self.window;

            let window_records = match self.archive.window(&hit.node_id, from, to).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(record_id = %hit.record_id, error = %e, "Window fetch failed, emitting bare hit");
                    vec![hit.clone()]
                }
            };

            for record in window_records {
                // The window query has no cutoff of its own; re-apply it so
                // neighbors still in the buffer stay out.
                if let Some(cut) = cutoff {
                    if record.timestamp >= cut {
                        continue;
                    }
                }
                if emitted.insert(record.record_id.clone()) {
                    results.push(record);
                }
            }
        }

        debug!(
            sub_queries = sub_queries.len(),
            records = results.len(),
            "Retrieval complete"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_archive::{HashEmbedder, SqliteArchive};
    use canopy_core::{ArchiveError, NodeId, Role};

    const DIM: usize = 32;

    async fn setup() -> (Arc<SqliteArchive>, Arc<HashEmbedder>) {
        let embedder = Arc::new(HashEmbedder::with_dimensions(DIM));
        let archive = Arc::new(
            SqliteArchive::in_memory(embedder.name(), DIM)
                .await
                .unwrap(),
        );
        (archive, embedder)
    }

    async fn index(
        archive: &SqliteArchive,
        embedder: &HashEmbedder,
        id: &str,
        node: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) {
        let embedding = embedder.embed(text).await.unwrap();
        archive
            .index(ArchiveRecord {
                record_id: RecordId(id.into()),
                node_id: NodeId::from(node),
                role: Role::User,
                text: text.into(),
                timestamp,
                node_title: "New Chat".into(),
                embedding,
            })
            .await
            .unwrap();
    }

    fn retriever(
        archive: Arc<SqliteArchive>,
        embedder: Arc<HashEmbedder>,
        window_seconds: f64,
    ) -> ContextWindowRetriever {
        ContextWindowRetriever::new(archive, embedder, window_seconds, 5, 5)
    }

    #[tokio::test]
    async fn cutoff_excludes_buffered_records() {
        let (archive, embedder) = setup().await;
        let base = Utc::now() - Duration::seconds(600);

        index(&archive, &embedder, "old", "n1", "my favorite color is blue", base).await;
        index(
            &archive,
            &embedder,
            "buffered",
            "n1",
            "my favorite color is still blue",
            base + Duration::seconds(300),
        )
        .await;

        let r = retriever(archive, embedder, 60.0);
        let results = r
            .retrieve(
                &["favorite color".into()],
                Some(base + Duration::seconds(300)),
            )
            .await;

        let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
        assert!(ids.contains(&"old"));
        assert!(!ids.contains(&"buffered"));
    }

    #[tokio::test]
    async fn merges_hits_across_sub_queries() {
        let (archive, embedder) = setup().await;
        let base = Utc::now() - Duration::seconds(600);

        index(&archive, &embedder, "name", "a", "my name is Alex", base).await;
        index(
            &archive,
            &embedder,
            "job",
            "b",
            "I work as an engineer",
            base + Duration::seconds(200),
        )
        .await;

        let r = retriever(archive, embedder, 10.0);
        let results = r
            .retrieve(&["my name is".into(), "I work as".into()], None)
            .await;

        let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
        assert!(ids.contains(&"name"));
        assert!(ids.contains(&"job"));
    }

    #[tokio::test]
    async fn window_pulls_temporal_neighbors() {
        let (archive, embedder) = setup().await;
        let base = Utc::now() - Duration::seconds(600);

        index(&archive, &embedder, "before", "n1", "unrelated banter", base).await;
        index(
            &archive,
            &embedder,
            "hit",
            "n1",
            "the keyword sforzando appears here",
            base + Duration::seconds(30),
        )
        .await;
        index(
            &archive,
            &embedder,
            "after",
            "n1",
            "more banter afterwards",
            base + Duration::seconds(60),
        )
        .await;
        index(
            &archive,
            &embedder,
            "far",
            "n1",
            "far away in time",
            base + Duration::seconds(300),
        )
        .await;

        let r = retriever(archive, embedder, 60.0);
        let results = r.retrieve(&["sforzando keyword".into()], None).await;

        let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
        assert!(ids.contains(&"hit"));
        assert!(ids.contains(&"before"));
        assert!(ids.contains(&"after"));
        assert!(!ids.contains(&"far"));

        // Window contents are chronological.
        let positions: Vec<usize> = ["before", "hit", "after"]
            .iter()
            .map(|id| ids.iter().position(|x| x == id).unwrap())
            .collect();
        assert!(positions[0] < positions[1] && positions[1] < positions[2]);
    }

    #[tokio::test]
    async fn widening_window_never_removes_records() {
        let (archive, embedder) = setup().await;
        let base = Utc::now() - Duration::seconds(600);

        for (i, text) in [
            "alpha topic zero",
            "the keyword sforzando appears here",
            "alpha topic two",
            "alpha topic three",
        ]
        .iter()
        .enumerate()
        {
            index(
                &archive,
                &embedder,
                &format!("r{i}"),
                "n1",
                text,
                base + Duration::seconds(45 * i as i64),
            )
            .await;
        }

        let narrow = retriever(archive.clone(), embedder.clone(), 30.0)
            .retrieve(&["sforzando keyword".into()], None)
            .await;
        let wide = retriever(archive, embedder, 120.0)
            .retrieve(&["sforzando keyword".into()], None)
            .await;

        let narrow_ids: HashSet<String> =
            narrow.iter().map(|r| r.record_id.to_string()).collect();
        let wide_ids: HashSet<String> = wide.iter().map(|r| r.record_id.to_string()).collect();
        assert!(
            narrow_ids.is_subset(&wide_ids),
            "narrow {narrow_ids:?} not within wide {wide_ids:?}"
        );
        assert!(wide_ids.len() >= narrow_ids.len());
    }

    #[tokio::test]
    async fn overlapping_windows_deduplicate() {
        let (archive, embedder) = setup().await;
        let base = Utc::now() - Duration::seconds(600);

        // Two hits 10s apart; their ±60s windows overlap completely.
        index(&archive, &embedder, "h1", "n1", "quokka sightings report", base).await;
        index(
            &archive,
            &embedder,
            "h2",
            "n1",
            "quokka sightings continued",
            base + Duration::seconds(10),
        )
        .await;

        let r = retriever(archive, embedder, 60.0);
        let results = r.retrieve(&["quokka sightings".into()], None).await;

        let ids: Vec<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        let unique: HashSet<&&str> = ids.iter().collect();
        assert_eq!(unique.len(), 2);
    }

    #[tokio::test]
    async fn failing_embedder_isolates_sub_query() {
        struct FlakyEmbedder {
            inner: HashEmbedder,
        }

        #[async_trait::async_trait]
        impl Embedder for FlakyEmbedder {
            fn name(&self) -> &str {
                self.inner.name()
            }
            fn dimensions(&self) -> usize {
                self.inner.dimensions()
            }
            async fn embed(&self, text: &str) -> Result<Vec<f32>, ArchiveError> {
                if text.contains("poison") {
                    return Err(ArchiveError::EmbeddingFailed("poisoned".into()));
                }
                self.inner.embed(text).await
            }
        }

        let inner = HashEmbedder::with_dimensions(DIM);
        let name = inner.name().to_string();
        let archive = Arc::new(SqliteArchive::in_memory(&name, DIM).await.unwrap());
        let good = HashEmbedder::with_dimensions(DIM);
        index(
            &archive,
            &good,
            "a",
            "n1",
            "my name is Alex",
            Utc::now() - Duration::seconds(600),
        )
        .await;

        let r = ContextWindowRetriever::new(
            archive,
            Arc::new(FlakyEmbedder { inner }),
            60.0,
            5,
            5,
        );
        let results = r
            .retrieve(&["poison query".into(), "my name is".into()], None)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record_id.as_str(), "a");
    }

    #[tokio::test]
    async fn empty_archive_returns_nothing() {
        let (archive, embedder) = setup().await;
        let r = retriever(archive, embedder, 60.0);
        assert!(r.retrieve(&["anything".into()], None).await.is_empty());
    }
}
