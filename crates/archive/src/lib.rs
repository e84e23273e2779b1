//! Archive implementations for Canopy.
//!
//! The archive is the system's long-term memory: a durable SQLite store of
//! every turn ever written, indexed by dense embedding and filterable by
//! node, role, and timestamp.

pub mod embedder;
pub mod score;
pub mod sqlite;

pub use embedder::{HashEmbedder, ProviderEmbedder, HASH_EMBEDDER_DIM};
pub use score::cosine_similarity;
pub use sqlite::SqliteArchive;

use canopy_core::{Archive, ArchiveError, ArchiveFilter, Embedder, ScoredRecord};

/// Convenience text query: embed `text` and run a filtered similarity search.
pub async fn query_text(
    archive: &dyn Archive,
    embedder: &dyn Embedder,
    text: &str,
    k: usize,
    filter: &ArchiveFilter,
) -> Result<Vec<ScoredRecord>, ArchiveError> {
    let embedding = embedder.embed(text).await?;
    archive.query(&embedding, k, filter).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{ArchiveRecord, NodeId, RecordId, Role};
    use chrono::Utc;

    #[tokio::test]
    async fn query_text_matches_manual_embed_and_query() {
        let embedder = HashEmbedder::with_dimensions(16);
        let archive = SqliteArchive::in_memory(embedder.name(), 16).await.unwrap();

        let text = "my favorite color is blue";
        archive
            .index(ArchiveRecord {
                record_id: RecordId::new(),
                node_id: NodeId::from("n1"),
                role: Role::User,
                text: text.into(),
                timestamp: Utc::now(),
                node_title: "New Chat".into(),
                embedding: embedder.embed(text).await.unwrap(),
            })
            .await
            .unwrap();

        let results = query_text(
            &archive,
            &embedder,
            "favorite color",
            5,
            &ArchiveFilter::default(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.text, text);
        assert!(results[0].score > 0.0);
    }
}
