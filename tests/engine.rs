//! Pipeline-level tests.
//!
//! These drive the refresh and duplicate-resolution flows end to end through
//! in-memory implementations of the three collaborator seams (tracker,
//! embedding service, store), so every scenario runs without a network or a
//! database.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use triage_harness::config::{Config, DbConfig, EmbeddingConfig, ServerConfig, TrackerConfig};
use triage_harness::dedup;
use triage_harness::embedding::{EmbedError, EmbeddingService};
use triage_harness::models::{
    CachedIssue, CachedState, IssueRecord, IssueRef, SimilarIssue, TrackerIssue,
};
use triage_harness::store::IssueStore;
use triage_harness::sync;
use triage_harness::tracker::TrackerClient;

// ============ Test collaborators ============

struct MockTracker {
    issues: Vec<TrackerIssue>,
}

impl MockTracker {
    fn new(issues: Vec<TrackerIssue>) -> Self {
        Self { issues }
    }
}

#[async_trait]
impl TrackerClient for MockTracker {
    async fn list_open_issue_numbers(&self, _repo: &str) -> anyhow::Result<Vec<IssueRef>> {
        Ok(self
            .issues
            .iter()
            .map(|i| IssueRef {
                number: i.number,
                updated_at: i.updated_at,
            })
            .collect())
    }

    async fn fetch_issues(
        &self,
        _repo: &str,
        numbers: &[i64],
    ) -> anyhow::Result<Vec<TrackerIssue>> {
        Ok(self
            .issues
            .iter()
            .filter(|i| numbers.contains(&i.number))
            .cloned()
            .collect())
    }
}

/// Deterministic embedding service: vectors come from a marker table keyed
/// by substring of the canonical text; failures are scripted per call.
struct MockEmbedder {
    vectors: Vec<(&'static str, Vec<f32>)>,
    failures: Mutex<VecDeque<EmbedError>>,
    /// Size of every embed call, in arrival order.
    calls: Mutex<Vec<usize>>,
    last_texts: Mutex<Vec<String>>,
}

impl MockEmbedder {
    fn new(vectors: Vec<(&'static str, Vec<f32>)>) -> Self {
        Self {
            vectors,
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            last_texts: Mutex::new(Vec::new()),
        }
    }

    fn fail_next(&self, errors: Vec<EmbedError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        self.vectors
            .iter()
            .find(|(marker, _)| text.contains(marker))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| vec![0.0, 0.0, 1.0])
    }
}

#[async_trait]
impl EmbeddingService for MockEmbedder {
    fn dims(&self) -> usize {
        3
    }

    fn native_dims(&self) -> usize {
        3072
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, EmbedError> {
        if text.contains("TOKFAIL") {
            return Err(EmbedError::InvalidResponse("tokenizer rejected text".to_string()));
        }
        Ok(text.split_whitespace().count())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.lock().unwrap().push(texts.len());
        *self.last_texts.lock().unwrap() = texts.to_vec();

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

#[derive(Clone)]
struct StoredRecord {
    record: IssueRecord,
    embedding_refreshed_at: Option<DateTime<Utc>>,
}

/// In-memory store mirroring the Postgres implementation's observable
/// behavior, including the refreshed-at-iff-embedding stamping and the
/// cosine-distance ranking.
#[derive(Default)]
struct MemoryStore {
    records: Mutex<HashMap<(String, i64), StoredRecord>>,
}

impl MemoryStore {
    fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn get(&self, repo: &str, number: i64) -> Option<StoredRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(repo.to_string(), number))
            .cloned()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b)) as f64
}

#[async_trait]
impl IssueStore for MemoryStore {
    async fn init_schema(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upsert(&self, record: &IssueRecord) -> anyhow::Result<()> {
        let refreshed_at = record.embedding.as_ref().map(|_| Utc::now());
        self.records.lock().unwrap().insert(
            (record.repo.clone(), record.number),
            StoredRecord {
                record: record.clone(),
                embedding_refreshed_at: refreshed_at,
            },
        );
        Ok(())
    }

    async fn cached_states(&self, repo: &str) -> anyhow::Result<HashMap<i64, CachedState>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|((_, number), stored)| {
                (
                    *number,
                    CachedState {
                        tracker_updated_at: Some(stored.record.tracker_updated_at),
                        embedding_refreshed_at: stored.embedding_refreshed_at,
                    },
                )
            })
            .collect())
    }

    async fn lookup(&self, repo: &str, number: i64) -> anyhow::Result<Option<CachedIssue>> {
        Ok(self.get(repo, number).map(|stored| CachedIssue {
            tracker_updated_at: Some(stored.record.tracker_updated_at),
            embedding: stored.record.embedding.clone(),
        }))
    }

    async fn similar_issues(
        &self,
        repo: &str,
        exclude_number: i64,
        embedding: &[f32],
        max_distance: f64,
    ) -> anyhow::Result<Vec<SimilarIssue>> {
        let mut matches: Vec<SimilarIssue> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|((r, number), _)| r == repo && *number != exclude_number)
            .filter_map(|((_, number), stored)| {
                let vec = stored.record.embedding.as_ref()?;
                let distance = cosine_distance(vec, embedding);
                (distance < max_distance).then(|| SimilarIssue {
                    number: *number,
                    title: stored.record.title.clone(),
                    distance,
                })
            })
            .collect();

        matches.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap());
        Ok(matches)
    }
}

// ============ Fixtures ============

const REPO: &str = "org/repo";

fn test_config() -> Config {
    Config {
        db: DbConfig {
            url: "postgres://unused".to_string(),
            max_connections: 5,
        },
        tracker: TrackerConfig::default(),
        embedding: EmbeddingConfig {
            provider: "gemini".to_string(),
            model: Some("fake-model".to_string()),
            dims: 3,
            native_dims: 3072,
            batch_size: 100,
            max_retries: 5,
            timeout_secs: 30,
            max_token_limit: 2048,
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn issue(number: i64, title: &str, updated: i64) -> TrackerIssue {
    TrackerIssue {
        number,
        title: title.to_string(),
        body: format!("body of issue {}", number),
        updated_at: ts(updated),
        comments: vec![],
    }
}

fn plain_embedder() -> MockEmbedder {
    MockEmbedder::new(vec![])
}

// ============ Refresh: staleness and idempotence ============

#[tokio::test]
async fn refresh_is_idempotent_without_tracker_changes() {
    let tracker = MockTracker::new(vec![
        issue(1, "first", 100),
        issue(2, "second", 100),
        issue(3, "third", 100),
    ]);
    let embedder = plain_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let report = sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();
    assert_eq!(report.status, "completed");
    assert_eq!(report.issues_processed, 3);
    assert_eq!(store.len(), 3);

    // Nothing changed upstream: second run processes 0.
    let report = sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();
    assert_eq!(report.issues_processed, 0);

    // Unless forced.
    let report = sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, true)
        .await
        .unwrap();
    assert_eq!(report.issues_processed, 3);
}

#[tokio::test]
async fn refresh_reembeds_only_updated_issues() {
    let embedder = plain_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let tracker = MockTracker::new(vec![issue(1, "first", 100), issue(2, "second", 100)]);
    sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();

    // Issue 2 was touched upstream; issue 1 was not.
    let tracker = MockTracker::new(vec![issue(1, "first", 100), issue(2, "second", 200)]);
    let report = sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();
    assert_eq!(report.issues_processed, 1);
    assert_eq!(
        store.get(REPO, 2).unwrap().record.tracker_updated_at,
        ts(200)
    );
}

#[tokio::test]
async fn refresh_with_no_open_issues_reports_zero() {
    let tracker = MockTracker::new(vec![]);
    let embedder = plain_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let report = sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();
    assert_eq!(report.status, "completed");
    assert_eq!(report.issues_processed, 0);
    assert!(report.message.contains("No open issues"));
}

// ============ Batch pipeline ============

#[tokio::test]
async fn batch_of_150_issues_triggers_two_embed_calls() {
    let issues: Vec<TrackerIssue> = (1..=150)
        .map(|n| issue(n, &format!("issue {}", n), 100))
        .collect();
    let embedder = plain_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let processed = sync::embed_stale_issues(&embedder, &store, &cfg, REPO, &issues, false)
        .await
        .unwrap();

    assert_eq!(processed, 150);
    assert_eq!(embedder.call_sizes(), vec![100, 50]);
    assert_eq!(store.len(), 150);
}

#[tokio::test]
async fn tokenization_failure_skips_item_but_not_batch() {
    let mut bad = issue(2, "second", 100);
    bad.body = "TOKFAIL".to_string();
    let issues = vec![issue(1, "first", 100), bad, issue(3, "third", 100)];

    let embedder = plain_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let processed = sync::embed_stale_issues(&embedder, &store, &cfg, REPO, &issues, false)
        .await
        .unwrap();

    assert_eq!(processed, 2);
    assert_eq!(embedder.call_sizes(), vec![2]);
    assert!(store.get(REPO, 2).is_none());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_batch_retries_with_backoff() {
    let issues = vec![issue(1, "first", 100)];
    let embedder = plain_embedder();
    embedder.fail_next(vec![
        EmbedError::RateLimited("429".to_string()),
        EmbedError::RateLimited("429".to_string()),
    ]);
    let store = MemoryStore::default();
    let cfg = test_config();

    let start = tokio::time::Instant::now();
    let processed = sync::embed_stale_issues(&embedder, &store, &cfg, REPO, &issues, false)
        .await
        .unwrap();

    assert_eq!(processed, 1);
    // Three attempts total: two rate-limited, then success.
    assert_eq!(embedder.call_sizes().len(), 3);
    // Backoff waits 1s after the first failure, 2s after the second.
    assert!(start.elapsed() >= std::time::Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_exhaustion_abandons_batch() {
    let issues = vec![issue(1, "first", 100)];
    let embedder = plain_embedder();
    embedder.fail_next(
        (0..5)
            .map(|_| EmbedError::RateLimited("429".to_string()))
            .collect(),
    );
    let store = MemoryStore::default();
    let cfg = test_config();

    let processed = sync::embed_stale_issues(&embedder, &store, &cfg, REPO, &issues, false)
        .await
        .unwrap();

    assert_eq!(processed, 0);
    assert_eq!(embedder.call_sizes().len(), 5);
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn non_rate_limit_error_abandons_batch_without_retry() {
    let issues: Vec<TrackerIssue> = (1..=150)
        .map(|n| issue(n, &format!("issue {}", n), 100))
        .collect();
    let embedder = plain_embedder();
    embedder.fail_next(vec![EmbedError::Api {
        status: 500,
        body: "server error".to_string(),
    }]);
    let store = MemoryStore::default();
    let cfg = test_config();

    let processed = sync::embed_stale_issues(&embedder, &store, &cfg, REPO, &issues, false)
        .await
        .unwrap();

    // First batch abandoned outright, second batch still processed.
    assert_eq!(processed, 50);
    assert_eq!(embedder.call_sizes(), vec![100, 50]);
    assert!(store.get(REPO, 1).is_none());
    assert!(store.get(REPO, 150).is_some());
}

// ============ Single-issue embed ============

#[tokio::test]
async fn single_embed_halves_text_over_token_limit() {
    let embedder = plain_embedder();
    let store = MemoryStore::default();
    let mut cfg = test_config();
    cfg.embedding.max_token_limit = 3;

    let target = issue(9, "a title with many words in it", 100);
    sync::embed_issue(&embedder, &store, &cfg, REPO, &target)
        .await
        .unwrap();

    let sent = embedder.last_texts.lock().unwrap()[0].clone();
    let full = triage_harness::normalize::canonical_text(
        &target.title,
        &target.body,
        &target.comments,
        cfg.embedding.max_chars(),
    );
    assert_eq!(sent.chars().count(), full.chars().count() / 2);

    // The stored record's truncated_text is the exact text embedded.
    let stored = store.get(REPO, 9).unwrap();
    assert_eq!(stored.record.truncated_text, sent);
    assert!(stored.embedding_refreshed_at.is_some());
}

// ============ Duplicate resolution ============

/// Marker table: #42 is the target; #7 and #9 are close, #8 is unrelated.
fn dup_embedder() -> MockEmbedder {
    MockEmbedder::new(vec![
        ("Crash on startup", vec![1.0, 0.0, 0.0]),
        ("Crash when starting", vec![0.96, 0.28, 0.0]),
        ("Startup crash loop", vec![0.92, 0.392, 0.0]),
        ("Feature request", vec![0.0, 1.0, 0.0]),
    ])
}

fn dup_issues() -> Vec<TrackerIssue> {
    vec![
        issue(7, "Crash when starting", 100),
        issue(8, "Feature request: dark mode", 100),
        issue(9, "Startup crash loop", 100),
    ]
}

#[tokio::test]
async fn duplicates_end_to_end_with_no_existing_record() {
    let embedder = dup_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    // Seed the cache with everything except the target issue.
    let seed_tracker = MockTracker::new(dup_issues());
    sync::run_refresh(&seed_tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();

    // The target is open upstream but has never been embedded.
    let mut all = dup_issues();
    all.push(issue(42, "Crash on startup", 100));
    let tracker = MockTracker::new(all);

    let report = dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 42, 0.9)
        .await
        .unwrap();

    assert_eq!(report.issue_number, 42);
    assert_eq!(report.repository, REPO);

    let numbers: Vec<i64> = report.duplicates.iter().map(|d| d.number).collect();
    assert_eq!(numbers, vec![7, 9], "closest first, unrelated excluded");

    for dup in &report.duplicates {
        assert!(dup.similarity >= 0.9, "similarity {} below threshold", dup.similarity);
        assert!(dup.similarity < 1.0);
    }

    // The target was embedded and cached as part of the query.
    assert!(store.get(REPO, 42).is_some());
}

#[tokio::test]
async fn duplicates_threshold_is_monotonic() {
    let embedder = dup_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let mut all = dup_issues();
    all.push(issue(42, "Crash on startup", 100));
    let tracker = MockTracker::new(all);
    sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();

    let loose = dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 42, 0.9)
        .await
        .unwrap();
    let strict = dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 42, 0.95)
        .await
        .unwrap();

    let loose_numbers: Vec<i64> = loose.duplicates.iter().map(|d| d.number).collect();
    let strict_numbers: Vec<i64> = strict.duplicates.iter().map(|d| d.number).collect();

    assert_eq!(loose_numbers, vec![7, 9]);
    assert_eq!(strict_numbers, vec![7]);
    assert!(strict_numbers.iter().all(|n| loose_numbers.contains(n)));
}

#[tokio::test]
async fn duplicates_reuses_fresh_cached_embedding() {
    let embedder = dup_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let mut all = dup_issues();
    all.push(issue(42, "Crash on startup", 100));
    let tracker = MockTracker::new(all);
    sync::run_refresh(&tracker, &embedder, &store, &cfg, REPO, false)
        .await
        .unwrap();

    let calls_before = embedder.call_sizes().len();
    dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 42, 0.9)
        .await
        .unwrap();
    assert_eq!(
        embedder.call_sizes().len(),
        calls_before,
        "cached embedding should be reused without an embed call"
    );
}

#[tokio::test]
async fn duplicates_reembeds_when_tracker_state_is_newer() {
    let embedder = dup_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let mut all = dup_issues();
    all.push(issue(42, "Crash on startup", 100));
    sync::run_refresh(
        &MockTracker::new(all.clone()),
        &embedder,
        &store,
        &cfg,
        REPO,
        false,
    )
    .await
    .unwrap();

    // The target issue was edited after the cache was built.
    all.last_mut().unwrap().updated_at = ts(200);
    let tracker = MockTracker::new(all);

    let calls_before = embedder.call_sizes().len();
    dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 42, 0.9)
        .await
        .unwrap();
    assert_eq!(embedder.call_sizes().len(), calls_before + 1);
    assert_eq!(
        store.get(REPO, 42).unwrap().record.tracker_updated_at,
        ts(200)
    );
}

#[tokio::test]
async fn duplicates_unknown_issue_is_not_found() {
    let tracker = MockTracker::new(dup_issues());
    let embedder = dup_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let err = dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 999, 0.9)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "got: {}", err);
}

#[tokio::test]
async fn duplicates_embedding_failure_surfaces_as_error() {
    let embedder = dup_embedder();
    embedder.fail_next(vec![EmbedError::Api {
        status: 500,
        body: "server error".to_string(),
    }]);
    let store = MemoryStore::default();
    let cfg = test_config();

    let mut all = dup_issues();
    all.push(issue(42, "Crash on startup", 100));
    let tracker = MockTracker::new(all);

    let err = dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 42, 0.9)
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("failed to generate embedding"),
        "got: {}",
        err
    );
}

#[tokio::test]
async fn duplicates_rejects_out_of_range_threshold() {
    let tracker = MockTracker::new(dup_issues());
    let embedder = dup_embedder();
    let store = MemoryStore::default();
    let cfg = test_config();

    let err = dedup::find_duplicates(&tracker, &embedder, &store, &cfg, REPO, 7, 1.5)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("must be within"), "got: {}", err);
}
