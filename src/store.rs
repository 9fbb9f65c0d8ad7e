//! Persistence layer for issue records and their embeddings.
//!
//! [`IssueStore`] is the seam the pipeline and the duplicate resolver write
//! and read through; [`PgIssueStore`] implements it over Postgres with the
//! `vector` extension. The store owns its bounded connection pool — it is
//! constructed once at process start and passed explicitly to components.
//! Each statement acquires and releases a pooled connection on its own, so
//! every exit path (including failure) returns the connection.
//!
//! Upsert semantics: `(number, repo_name)` is the identity; a re-save fully
//! replaces prior field values. `embedding_refreshed_at` is stamped with the
//! current UTC time iff an embedding is supplied, and left null otherwise —
//! the two columns are always written together.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::migrate;
use crate::models::{CachedIssue, CachedState, IssueRecord, SimilarIssue};

/// Storage seam for issue records, embeddings, and similarity queries.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Idempotent creation of the backing table and index. Safe to call
    /// repeatedly; invoked lazily by both caller-facing operations.
    async fn init_schema(&self) -> Result<()>;

    /// Idempotent write keyed by `(record.number, record.repo)`.
    async fn upsert(&self, record: &IssueRecord) -> Result<()>;

    /// Persisted timestamps for every record in `repo`, keyed by number.
    async fn cached_states(&self, repo: &str) -> Result<HashMap<i64, CachedState>>;

    /// Point lookup of one record's staleness marker and embedding.
    async fn lookup(&self, repo: &str, number: i64) -> Result<Option<CachedIssue>>;

    /// Records in `repo` other than `exclude_number` whose cosine distance to
    /// `embedding` is strictly below `max_distance`, closest first.
    async fn similar_issues(
        &self,
        repo: &str,
        exclude_number: i64,
        embedding: &[f32],
        max_distance: f64,
    ) -> Result<Vec<SimilarIssue>>;
}

/// Postgres/pgvector implementation of [`IssueStore`].
pub struct PgIssueStore {
    pool: PgPool,
    dims: usize,
}

impl PgIssueStore {
    pub fn new(pool: PgPool, dims: usize) -> Self {
        Self { pool, dims }
    }
}

#[async_trait]
impl IssueStore for PgIssueStore {
    async fn init_schema(&self) -> Result<()> {
        migrate::run_migrations(&self.pool, self.dims).await
    }

    async fn upsert(&self, record: &IssueRecord) -> Result<()> {
        let comments_json =
            serde_json::to_string(&record.comments).context("failed to encode comments")?;
        let embedding = record.embedding.as_ref().map(|e| Vector::from(e.clone()));
        let refreshed_at = record.embedding.as_ref().map(|_| Utc::now());

        sqlx::query(
            r#"
            INSERT INTO issues (number, repo_name, title, body, comments,
                                tracker_updated_at, token_count, truncated_text,
                                embedding, embedding_refreshed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (number, repo_name) DO UPDATE SET
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                comments = EXCLUDED.comments,
                tracker_updated_at = EXCLUDED.tracker_updated_at,
                token_count = EXCLUDED.token_count,
                truncated_text = EXCLUDED.truncated_text,
                embedding = EXCLUDED.embedding,
                embedding_refreshed_at = EXCLUDED.embedding_refreshed_at
            "#,
        )
        .bind(record.number)
        .bind(&record.repo)
        .bind(&record.title)
        .bind(&record.body)
        .bind(&comments_json)
        .bind(record.tracker_updated_at)
        .bind(record.token_count)
        .bind(&record.truncated_text)
        .bind(embedding)
        .bind(refreshed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save issue #{} in {}", record.number, record.repo))?;

        Ok(())
    }

    async fn cached_states(&self, repo: &str) -> Result<HashMap<i64, CachedState>> {
        let rows = sqlx::query(
            "SELECT number, tracker_updated_at, embedding_refreshed_at FROM issues WHERE repo_name = $1",
        )
        .bind(repo)
        .fetch_all(&self.pool)
        .await?;

        let states = rows
            .iter()
            .map(|row| {
                (
                    row.get::<i64, _>("number"),
                    CachedState {
                        tracker_updated_at: row.get("tracker_updated_at"),
                        embedding_refreshed_at: row.get("embedding_refreshed_at"),
                    },
                )
            })
            .collect();

        Ok(states)
    }

    async fn lookup(&self, repo: &str, number: i64) -> Result<Option<CachedIssue>> {
        let row = sqlx::query(
            "SELECT tracker_updated_at, embedding FROM issues WHERE number = $1 AND repo_name = $2",
        )
        .bind(number)
        .bind(repo)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CachedIssue {
            tracker_updated_at: row.get("tracker_updated_at"),
            embedding: row
                .get::<Option<Vector>, _>("embedding")
                .map(|v| v.to_vec()),
        }))
    }

    async fn similar_issues(
        &self,
        repo: &str,
        exclude_number: i64,
        embedding: &[f32],
        max_distance: f64,
    ) -> Result<Vec<SimilarIssue>> {
        let vector = Vector::from(embedding.to_vec());

        let rows = sqlx::query(
            r#"
            SELECT number, title, (embedding <=> $1) AS distance
            FROM issues
            WHERE repo_name = $2
              AND number != $3
              AND embedding IS NOT NULL
              AND (embedding <=> $1) < $4
            ORDER BY distance ASC
            "#,
        )
        .bind(&vector)
        .bind(repo)
        .bind(exclude_number)
        .bind(max_distance)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SimilarIssue {
                number: row.get("number"),
                title: row.get("title"),
                distance: row.get("distance"),
            })
            .collect())
    }
}
