//! Refresh orchestration and the embedding pipeline.
//!
//! Coordinates the full sync flow: tracker fetch → staleness classification →
//! canonical text → token counting → batched embedding with rate-limit
//! backoff → persistence. Only the batch path retries; the single-issue path
//! (used by the duplicate resolver) fails fast.
//!
//! Failure containment rules:
//! - A token-counting failure skips that one issue and continues.
//! - A rate-limited embed call is retried with exponential backoff; any
//!   other embed failure abandons the whole batch, and nothing from it is
//!   persisted.
//! - A failed save skips that one item without aborting its siblings.
//! The processed count reflects only items that were embedded *and* saved.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::embedding::{normalize_vector, EmbedError, EmbeddingService};
use crate::models::{IssueRecord, RefreshReport, TrackerIssue};
use crate::normalize;
use crate::retry::RetryPolicy;
use crate::staleness;
use crate::store::IssueStore;
use crate::tracker::TrackerClient;

/// Sync embeddings for all open issues of `repo` (`"owner/name"`).
///
/// Always returns a structured report; tracker failures degrade to a
/// zero-processed outcome rather than an error.
pub async fn run_refresh(
    tracker: &dyn TrackerClient,
    embedder: &dyn EmbeddingService,
    store: &dyn IssueStore,
    config: &Config,
    repo: &str,
    force: bool,
) -> Result<RefreshReport> {
    println!("Starting embedding refresh for repository: {}", repo);

    let issues = fetch_open_issues(tracker, repo).await;

    if issues.is_empty() {
        let message = format!(
            "No open issues found for repository '{}' or failed to fetch them.",
            repo
        );
        eprintln!("Warning: {}", message);
        return Ok(RefreshReport {
            status: "completed".to_string(),
            message,
            issues_processed: 0,
        });
    }

    store.init_schema().await?;

    let processed = embed_stale_issues(embedder, store, config, repo, &issues, force).await?;

    let message = format!(
        "Embedding refresh completed for repository '{}'. Processed {} issues.",
        repo, processed
    );
    println!("{}", message);

    Ok(RefreshReport {
        status: "completed".to_string(),
        message,
        issues_processed: processed,
    })
}

/// List open issue numbers, then fetch full details in batches.
///
/// Both steps degrade to an empty result on failure — refresh reports
/// "nothing to do" rather than erroring out.
async fn fetch_open_issues(tracker: &dyn TrackerClient, repo: &str) -> Vec<TrackerIssue> {
    let refs = match tracker.list_open_issue_numbers(repo).await {
        Ok(refs) => refs,
        Err(e) => {
            eprintln!("Warning: failed to list open issues for {}: {}", repo, e);
            return Vec::new();
        }
    };

    if refs.is_empty() {
        return Vec::new();
    }

    println!("Found {} open issues.", refs.len());
    let numbers: Vec<i64> = refs.iter().map(|r| r.number).collect();

    match tracker.fetch_issues(repo, &numbers).await {
        Ok(issues) => issues,
        Err(e) => {
            eprintln!("Warning: failed to fetch issue details for {}: {}", repo, e);
            Vec::new()
        }
    }
}

struct EmbedItem<'a> {
    issue: &'a TrackerIssue,
    token_count: i64,
    /// The exact text submitted for embedding.
    text: String,
}

/// Embed and persist every stale issue in `issues`; returns how many were
/// successfully embedded and saved.
pub async fn embed_stale_issues(
    embedder: &dyn EmbeddingService,
    store: &dyn IssueStore,
    config: &Config,
    repo: &str,
    issues: &[TrackerIssue],
    force: bool,
) -> Result<u64> {
    let stale: Vec<&TrackerIssue> = if force {
        println!("Force refresh requested, processing all {} issues.", issues.len());
        issues.iter().collect()
    } else {
        let cached = store.cached_states(repo).await?;
        staleness::stale_issues(issues, &cached, false)
    };

    if stale.is_empty() {
        println!("All issue embeddings are up to date. Nothing to process.");
        return Ok(0);
    }

    println!("Found {} new or updated issues.", stale.len());

    // Per-item tokenization; one failing issue must not abort the rest.
    let mut token_errors = 0usize;
    let mut items: Vec<EmbedItem> = Vec::with_capacity(stale.len());

    for &issue in &stale {
        let text = normalize::canonical_text(
            &issue.title,
            &issue.body,
            &issue.comments,
            config.embedding.max_chars(),
        );

        match embedder.count_tokens(&text).await {
            Ok(token_count) => {
                let text = if token_count > config.embedding.max_token_limit {
                    normalize::halve_chars(&text)
                } else {
                    text
                };
                items.push(EmbedItem {
                    issue,
                    token_count: token_count as i64,
                    text,
                });
            }
            Err(e) => {
                eprintln!(
                    "Warning: token counting failed for issue #{}: {}",
                    issue.number, e
                );
                token_errors += 1;
            }
        }
    }

    if token_errors > 0 {
        eprintln!(
            "Warning: {} issues had token counting errors and were skipped.",
            token_errors
        );
    }

    let policy = RetryPolicy::new(config.embedding.max_retries);
    let mut processed = 0u64;

    for batch in items.chunks(config.embedding.batch_size) {
        let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();

        let vectors = match embed_with_backoff(embedder, &policy, &texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                eprintln!("Warning: embedding batch failed, abandoning it: {}", e);
                continue;
            }
        };

        for (item, mut vector) in batch.iter().zip(vectors.into_iter()) {
            if embedder.needs_normalization() {
                normalize_vector(&mut vector);
            }

            let record = build_record(repo, item.issue, item.token_count, &item.text, Some(vector));
            match store.upsert(&record).await {
                Ok(()) => processed += 1,
                Err(e) => eprintln!("Warning: failed to save issue #{}: {}", item.issue.number, e),
            }
        }

        println!("  processed batch of {} embeddings", batch.len());
    }

    println!("  embedded and saved: {}", processed);
    Ok(processed)
}

/// One embed call per attempt; only rate-limit failures are retried, with
/// the policy's exponential backoff between attempts.
async fn embed_with_backoff(
    embedder: &dyn EmbeddingService,
    policy: &RetryPolicy,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut attempt = 0u32;

    loop {
        match embedder.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if policy.retryable(&e) && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                eprintln!(
                    "Warning: rate limit hit, waiting {:.1}s before retrying batch",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Embed a single issue and persist the result. Fails fast: no retry on any
/// error, and a persistence failure fails the call.
pub async fn embed_issue(
    embedder: &dyn EmbeddingService,
    store: &dyn IssueStore,
    config: &Config,
    repo: &str,
    issue: &TrackerIssue,
) -> Result<Vec<f32>> {
    let text = normalize::canonical_text(
        &issue.title,
        &issue.body,
        &issue.comments,
        config.embedding.max_chars(),
    );

    let token_count = embedder
        .count_tokens(&text)
        .await
        .with_context(|| format!("token counting failed for issue #{}", issue.number))?;

    let text = if token_count > config.embedding.max_token_limit {
        normalize::halve_chars(&text)
    } else {
        text
    };

    let mut vectors = embedder
        .embed(std::slice::from_ref(&text))
        .await
        .with_context(|| format!("embedding failed for issue #{}", issue.number))?;

    if vectors.is_empty() {
        anyhow::bail!("embedding service returned no vector for issue #{}", issue.number);
    }
    let mut vector = vectors.remove(0);

    if embedder.needs_normalization() {
        normalize_vector(&mut vector);
    }

    let record = build_record(repo, issue, token_count as i64, &text, Some(vector.clone()));
    store.upsert(&record).await?;

    Ok(vector)
}

fn build_record(
    repo: &str,
    issue: &TrackerIssue,
    token_count: i64,
    truncated_text: &str,
    embedding: Option<Vec<f32>>,
) -> IssueRecord {
    IssueRecord {
        number: issue.number,
        repo: repo.to_string(),
        title: issue.title.clone(),
        body: issue.body.clone(),
        comments: issue.comments.clone(),
        tracker_updated_at: issue.updated_at,
        token_count,
        truncated_text: truncated_text.to_string(),
        embedding,
    }
}
