//! Duplicate resolution for a single issue.
//!
//! Ensures the target issue's embedding is current (reusing the persisted
//! one when the cached record is at least as new as the tracker state),
//! then ranks every other issue in the repository by cosine distance and
//! keeps those under the caller's similarity threshold.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::EmbeddingService;
use crate::models::{DuplicateMatch, DuplicateReport};
use crate::store::IssueStore;
use crate::sync;
use crate::tracker::TrackerClient;

/// Find near-duplicates of `issue_number` in `repo` (`"owner/name"`).
///
/// `threshold` is caller-facing similarity in `0..=1` (higher = stricter);
/// it converts to a cosine-distance bound of `1 - threshold`. Matches come
/// back closest first, each with `similarity = 1 - distance`.
pub async fn find_duplicates(
    tracker: &dyn TrackerClient,
    embedder: &dyn EmbeddingService,
    store: &dyn IssueStore,
    config: &Config,
    repo: &str,
    issue_number: i64,
    threshold: f64,
) -> Result<DuplicateReport> {
    if !(0.0..=1.0).contains(&threshold) {
        bail!("threshold must be within [0, 1], got {}", threshold);
    }

    let fetched = tracker.fetch_issues(repo, &[issue_number]).await?;
    let Some(issue) = fetched.into_iter().next() else {
        bail!(
            "issue #{} not found in repository '{}' (or could not be fetched)",
            issue_number,
            repo
        );
    };

    store.init_schema().await?;

    // Reuse the persisted embedding when the cached record is not older
    // than the freshly fetched tracker state.
    let cached = store.lookup(repo, issue_number).await?;
    let reusable = cached.and_then(|c| match (c.tracker_updated_at, c.embedding) {
        (Some(db_updated_at), Some(vec)) if issue.updated_at <= db_updated_at => Some(vec),
        _ => None,
    });

    let embedding = match reusable {
        Some(vec) => vec,
        None => sync::embed_issue(embedder, store, config, repo, &issue)
            .await
            .map_err(|e| {
                anyhow::anyhow!("failed to generate embedding for issue #{}: {}", issue_number, e)
            })?,
    };

    let distance_threshold = 1.0 - threshold;
    let matches = store
        .similar_issues(repo, issue_number, &embedding, distance_threshold)
        .await?;

    let duplicates = matches
        .into_iter()
        .map(|m| DuplicateMatch {
            number: m.number,
            title: m.title,
            similarity: 1.0 - m.distance,
        })
        .collect();

    Ok(DuplicateReport {
        issue_number,
        repository: repo.to_string(),
        duplicates,
    })
}
