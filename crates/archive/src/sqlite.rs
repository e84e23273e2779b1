//! SQLite archive backend.
//!
//! A single database file holds every archived turn: metadata columns for
//! filtering plus the embedding as a little-endian f32 BLOB. Similarity
//! ranking happens in-process with cosine scoring over the filtered
//! candidate rows. A one-row `collection_meta` table pins the embedding
//! model and dimension; opening the store with a different embedder is
//! rejected so vectors from incompatible models never mix.

use crate::score::cosine_similarity;
use async_trait::async_trait;
use canopy_core::{
    Archive, ArchiveError, ArchiveFilter, ArchiveRecord, NodeId, RecordId, Role, ScoredRecord,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A durable SQLite-backed archive.
#[derive(Debug)]
pub struct SqliteArchive {
    pool: SqlitePool,
    embedding_model: String,
    dimensions: usize,
}

impl SqliteArchive {
    /// Open (or create) the archive at the given path.
    ///
    /// The `embedding_model` and `dimensions` are pinned in the collection on
    /// first open; later opens with different values fail with
    /// `CollectionMismatch`.
    pub async fn new(
        path: &str,
        embedding_model: &str,
        dimensions: usize,
    ) -> Result<Self, ArchiveError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| ArchiveError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ArchiveError::Storage(format!("Failed to open SQLite: {e}")))?;

        let archive = Self {
            pool,
            embedding_model: embedding_model.to_string(),
            dimensions,
        };
        archive.run_migrations().await?;
        archive.check_collection().await?;
        info!(path, model = embedding_model, "SQLite archive ready");
        Ok(archive)
    }

    /// An ephemeral in-process archive (tests).
    pub async fn in_memory(embedding_model: &str, dimensions: usize) -> Result<Self, ArchiveError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ArchiveError::Storage(format!("Invalid SQLite URL: {e}")))?;

        // A single connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ArchiveError::Storage(format!("Failed to open SQLite: {e}")))?;

        let archive = Self {
            pool,
            embedding_model: embedding_model.to_string(),
            dimensions,
        };
        archive.run_migrations().await?;
        archive.check_collection().await?;
        Ok(archive)
    }

    async fn run_migrations(&self) -> Result<(), ArchiveError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                record_id    TEXT PRIMARY KEY,
                node_id      TEXT NOT NULL,
                role         TEXT NOT NULL,
                content      TEXT NOT NULL,
                timestamp_us INTEGER NOT NULL,
                node_title   TEXT NOT NULL,
                embedding    BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ArchiveError::MigrationFailed(format!("records table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_node_time ON records(node_id, timestamp_us)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ArchiveError::MigrationFailed(format!("node/time index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_time ON records(timestamp_us)")
            .execute(&self.pool)
            .await
            .map_err(|e| ArchiveError::MigrationFailed(format!("time index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_meta (
                id              INTEGER PRIMARY KEY CHECK (id = 1),
                embedding_model TEXT NOT NULL,
                dimensions      INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ArchiveError::MigrationFailed(format!("meta table: {e}")))?;

        debug!("SQLite archive migrations complete");
        Ok(())
    }

    /// Pin or verify the collection's embedding model.
    async fn check_collection(&self) -> Result<(), ArchiveError> {
        let existing: Option<(String, i64)> =
            sqlx::query_as("SELECT embedding_model, dimensions FROM collection_meta WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ArchiveError::Storage(format!("meta read: {e}")))?;

        match existing {
            Some((model, dims)) => {
                if model != self.embedding_model || dims as usize != self.dimensions {
                    return Err(ArchiveError::CollectionMismatch {
                        stored: format!("{model} ({dims}d)"),
                        requested: format!("{} ({}d)", self.embedding_model, self.dimensions),
                    });
                }
                Ok(())
            }
            None => {
                sqlx::query(
                    "INSERT INTO collection_meta (id, embedding_model, dimensions) VALUES (1, ?, ?)",
                )
                .bind(&self.embedding_model)
                .bind(self.dimensions as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| ArchiveError::Storage(format!("meta write: {e}")))?;
                Ok(())
            }
        }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ArchiveRecord, ArchiveError> {
        let role_str: String = row
            .try_get("role")
            .map_err(|e| ArchiveError::Storage(format!("role column: {e}")))?;
        let role = Role::parse(&role_str)
            .ok_or_else(|| ArchiveError::Storage(format!("unknown role '{role_str}'")))?;

        let timestamp_us: i64 = row
            .try_get("timestamp_us")
            .map_err(|e| ArchiveError::Storage(format!("timestamp column: {e}")))?;
        let timestamp = us_to_datetime(timestamp_us)?;

        let embedding_blob: Vec<u8> = row
            .try_get("embedding")
            .map_err(|e| ArchiveError::Storage(format!("embedding column: {e}")))?;

        Ok(ArchiveRecord {
            record_id: RecordId(
                row.try_get("record_id")
                    .map_err(|e| ArchiveError::Storage(format!("record_id column: {e}")))?,
            ),
            node_id: NodeId(
                row.try_get("node_id")
                    .map_err(|e| ArchiveError::Storage(format!("node_id column: {e}")))?,
            ),
            role,
            text: row
                .try_get("content")
                .map_err(|e| ArchiveError::Storage(format!("content column: {e}")))?,
            timestamp,
            node_title: row
                .try_get("node_title")
                .map_err(|e| ArchiveError::Storage(format!("node_title column: {e}")))?,
            embedding: blob_to_embedding(&embedding_blob),
        })
    }

    /// Fetch candidate rows matching the metadata filter.
    async fn candidates(&self, filter: &ArchiveFilter) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT record_id, node_id, role, content, timestamp_us, node_title, embedding \
             FROM records WHERE 1=1",
        );

        if let Some(node_id) = &filter.node_id {
            builder.push(" AND node_id = ");
            builder.push_bind(node_id.as_str().to_string());
        }
        if let Some(roles) = &filter.roles {
            if !roles.is_empty() {
                builder.push(" AND role IN (");
                let mut separated = builder.separated(", ");
                for role in roles {
                    separated.push_bind(role.as_str());
                }
                builder.push(")");
            }
        }
        if let Some(cutoff) = filter.max_timestamp {
            builder.push(" AND timestamp_us < ");
            builder.push_bind(cutoff.timestamp_micros());
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ArchiveError::QueryFailed(e.to_string()))?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl Archive for SqliteArchive {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn index(&self, record: ArchiveRecord) -> Result<(), ArchiveError> {
        if record.embedding.len() != self.dimensions {
            return Err(ArchiveError::Storage(format!(
                "embedding has {} dimensions, collection expects {}",
                record.embedding.len(),
                self.dimensions
            )));
        }

        sqlx::query(
            "INSERT INTO records (record_id, node_id, role, content, timestamp_us, node_title, embedding) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.record_id.as_str())
        .bind(record.node_id.as_str())
        .bind(record.role.as_str())
        .bind(&record.text)
        .bind(record.timestamp.timestamp_micros())
        .bind(&record.node_title)
        .bind(embedding_to_blob(&record.embedding))
        .execute(&self.pool)
        .await
        .map_err(|e| ArchiveError::Storage(format!("insert: {e}")))?;

        debug!(record_id = %record.record_id, node_id = %record.node_id, "Indexed record");
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &ArchiveFilter,
    ) -> Result<Vec<ScoredRecord>, ArchiveError> {
        let candidates = self.candidates(filter).await?;

        let mut scored: Vec<ScoredRecord> = candidates
            .into_iter()
            .map(|record| {
                let score = cosine_similarity(&record.embedding, embedding);
                ScoredRecord { record, score }
            })
            .collect();

        // Descending score; equal scores resolve by timestamp then record id
        // so result order is stable across runs.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.timestamp.cmp(&b.record.timestamp))
                .then_with(|| a.record.record_id.cmp(&b.record.record_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn window(
        &self,
        node_id: &NodeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let rows = sqlx::query(
            "SELECT record_id, node_id, role, content, timestamp_us, node_title, embedding \
             FROM records WHERE node_id = ? AND timestamp_us >= ? AND timestamp_us <= ? \
             ORDER BY timestamp_us ASC",
        )
        .bind(node_id.as_str())
        .bind(from.timestamp_micros())
        .bind(to.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ArchiveError::QueryFailed(e.to_string()))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn update_node_title(
        &self,
        node_id: &NodeId,
        new_title: &str,
    ) -> Result<u64, ArchiveError> {
        let result = sqlx::query("UPDATE records SET node_title = ? WHERE node_id = ?")
            .bind(new_title)
            .bind(node_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| ArchiveError::Storage(format!("title update: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64, ArchiveError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ArchiveError::QueryFailed(e.to_string()))?;
        Ok(count.0 as u64)
    }

    async fn stats(&self) -> Result<Vec<(NodeId, u64)>, ArchiveError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT node_id, COUNT(*) FROM records GROUP BY node_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ArchiveError::QueryFailed(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, n)| (NodeId(id), n as u64))
            .collect())
    }

    async fn clear(&self) -> Result<(), ArchiveError> {
        sqlx::query("DELETE FROM records")
            .execute(&self.pool)
            .await
            .map_err(|e| ArchiveError::Storage(format!("clear: {e}")))?;
        Ok(())
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn us_to_datetime(us: i64) -> Result<DateTime<Utc>, ArchiveError> {
    DateTime::<Utc>::from_timestamp_micros(us)
        .ok_or_else(|| ArchiveError::Storage(format!("timestamp out of range: {us}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const DIM: usize = 4;

    async fn archive() -> SqliteArchive {
        SqliteArchive::in_memory("test-model", DIM).await.unwrap()
    }

    fn record(
        id: &str,
        node: &str,
        text: &str,
        timestamp: DateTime<Utc>,
        embedding: Vec<f32>,
    ) -> ArchiveRecord {
        ArchiveRecord {
            record_id: RecordId(id.into()),
            node_id: NodeId::from(node),
            role: Role::User,
            text: text.into(),
            timestamp,
            node_title: "New Chat".into(),
            embedding,
        }
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&v)), v);
    }

    #[tokio::test]
    async fn index_and_query_ranks_by_similarity() {
        let archive = archive().await;
        let now = Utc::now();

        archive
            .index(record("a", "n1", "orthogonal", now, vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("b", "n1", "identical", now + Duration::seconds(1), vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("c", "n1", "partial", now + Duration::seconds(2), vec![0.5, 0.5, 0.0, 0.0]))
            .await
            .unwrap();

        let results = archive
            .query(&[1.0, 0.0, 0.0, 0.0], 10, &ArchiveFilter::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].record.record_id.as_str(), "b");
        assert_eq!(results[1].record.record_id.as_str(), "c");
        assert_eq!(results[2].record.record_id.as_str(), "a");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn cutoff_filter_is_exclusive() {
        let archive = archive().await;
        let base = Utc::now();

        archive
            .index(record("old", "n1", "old", base, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record(
                "cut",
                "n1",
                "at cutoff",
                base + Duration::seconds(10),
                vec![1.0, 0.0, 0.0, 0.0],
            ))
            .await
            .unwrap();
        archive
            .index(record(
                "new",
                "n1",
                "new",
                base + Duration::seconds(20),
                vec![1.0, 0.0, 0.0, 0.0],
            ))
            .await
            .unwrap();

        let filter = ArchiveFilter::before(base + Duration::seconds(10));
        let results = archive
            .query(&[1.0, 0.0, 0.0, 0.0], 10, &filter)
            .await
            .unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.record.record_id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[tokio::test]
    async fn node_filter_restricts_results() {
        let archive = archive().await;
        let now = Utc::now();

        archive
            .index(record("a", "n1", "mine", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("b", "n2", "theirs", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        let filter = ArchiveFilter {
            node_id: Some(NodeId::from("n1")),
            ..Default::default()
        };
        let results = archive
            .query(&[1.0, 0.0, 0.0, 0.0], 10, &filter)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.node_id.as_str(), "n1");
    }

    #[tokio::test]
    async fn role_filter_restricts_results() {
        let archive = archive().await;
        let now = Utc::now();

        archive
            .index(record("u", "n1", "question", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        let mut assistant = record(
            "a",
            "n1",
            "answer",
            now + Duration::seconds(1),
            vec![1.0, 0.0, 0.0, 0.0],
        );
        assistant.role = Role::Assistant;
        archive.index(assistant).await.unwrap();

        let filter = ArchiveFilter {
            roles: Some(vec![Role::Assistant]),
            ..Default::default()
        };
        let results = archive
            .query(&[1.0, 0.0, 0.0, 0.0], 10, &filter)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.role, Role::Assistant);
    }

    #[tokio::test]
    async fn window_returns_chronological_slice() {
        let archive = archive().await;
        let base = Utc::now();

        for (i, id) in ["w1", "w2", "w3", "w4"].iter().enumerate() {
            archive
                .index(record(
                    id,
                    "n1",
                    &format!("msg {i}"),
                    base + Duration::seconds(30 * i as i64),
                    vec![1.0, 0.0, 0.0, 0.0],
                ))
                .await
                .unwrap();
        }

        let window = archive
            .window(
                &NodeId::from("n1"),
                base + Duration::seconds(25),
                base + Duration::seconds(65),
            )
            .await
            .unwrap();

        let ids: Vec<&str> = window.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["w2", "w3"]);
        assert!(window[0].timestamp < window[1].timestamp);
    }

    #[tokio::test]
    async fn update_node_title_rewrites_existing_records() {
        let archive = archive().await;
        let now = Utc::now();
        archive
            .index(record("a", "n1", "x", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("b", "n1", "y", now + Duration::seconds(1), vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("c", "n2", "z", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        let touched = archive
            .update_node_title(&NodeId::from("n1"), "Snake Handling")
            .await
            .unwrap();
        assert_eq!(touched, 2);

        let results = archive
            .query(
                &[1.0, 0.0, 0.0, 0.0],
                10,
                &ArchiveFilter {
                    node_id: Some(NodeId::from("n1")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.record.node_title == "Snake Handling"));
    }

    #[tokio::test]
    async fn dimension_mismatch_rejected_on_index() {
        let archive = archive().await;
        let err = archive
            .index(record("a", "n1", "x", Utc::now(), vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Storage(_)));
    }

    #[tokio::test]
    async fn duplicate_record_id_rejected() {
        let archive = archive().await;
        let now = Utc::now();
        archive
            .index(record("dup", "n1", "x", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert!(archive
            .index(record("dup", "n1", "x again", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn count_and_stats() {
        let archive = archive().await;
        let now = Utc::now();
        archive
            .index(record("a", "n1", "x", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("b", "n1", "y", now + Duration::seconds(1), vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        archive
            .index(record("c", "n2", "z", now, vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        assert_eq!(archive.count().await.unwrap(), 3);

        let mut stats = archive.stats().await.unwrap();
        stats.sort();
        assert_eq!(
            stats,
            vec![(NodeId::from("n1"), 2), (NodeId::from("n2"), 1)]
        );

        archive.clear().await.unwrap();
        assert_eq!(archive.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persists_across_reopen_and_rejects_model_change() {
        let path = std::env::temp_dir().join(format!("canopy-test-{}.db", uuid::Uuid::new_v4()));
        let path_str = path.to_str().unwrap().to_string();

        {
            let archive = SqliteArchive::new(&path_str, "model-a", DIM).await.unwrap();
            archive
                .index(record("a", "n1", "persisted", Utc::now(), vec![1.0, 0.0, 0.0, 0.0]))
                .await
                .unwrap();
        }

        // Same model: reopen sees the record.
        {
            let archive = SqliteArchive::new(&path_str, "model-a", DIM).await.unwrap();
            assert_eq!(archive.count().await.unwrap(), 1);
        }

        // Different model: rejected.
        let err = SqliteArchive::new(&path_str, "model-b", DIM).await.unwrap_err();
        assert!(matches!(err, ArchiveError::CollectionMismatch { .. }));

        let _ = std::fs::remove_file(&path);
    }
}
