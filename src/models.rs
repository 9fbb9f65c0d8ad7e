//! Core data models used throughout Triage Harness.
//!
//! These types represent the tracker issues, cached records, and reports that
//! flow through the sync and duplicate-resolution pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lightweight reference returned by the tracker's open-issue listing.
#[derive(Debug, Clone)]
pub struct IssueRef {
    pub number: i64,
    pub updated_at: DateTime<Utc>,
}

/// Full issue state as fetched from the tracker.
#[derive(Debug, Clone)]
pub struct TrackerIssue {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
    /// Comment bodies in chronological order.
    pub comments: Vec<String>,
}

/// The record written to the store on every successful embed-and-save.
///
/// Keyed by `(number, repo)`; an upsert fully replaces prior field values.
/// `embedding_refreshed_at` is not part of the write model — the store stamps
/// it at write time iff `embedding` is present.
#[derive(Debug, Clone)]
pub struct IssueRecord {
    pub number: i64,
    pub repo: String,
    pub title: String,
    pub body: String,
    pub comments: Vec<String>,
    pub tracker_updated_at: DateTime<Utc>,
    pub token_count: i64,
    /// The exact text that produced `embedding`.
    pub truncated_text: String,
    pub embedding: Option<Vec<f32>>,
}

/// Persisted timestamps read back for the staleness comparison.
#[derive(Debug, Clone, Default)]
pub struct CachedState {
    pub tracker_updated_at: Option<DateTime<Utc>>,
    pub embedding_refreshed_at: Option<DateTime<Utc>>,
}

/// Point-lookup result used by the duplicate resolver.
#[derive(Debug, Clone)]
pub struct CachedIssue {
    pub tracker_updated_at: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
}

/// A row returned by the store's similarity query, closest first.
#[derive(Debug, Clone)]
pub struct SimilarIssue {
    pub number: i64,
    pub title: String,
    /// Cosine distance to the target embedding; 0 = identical direction.
    pub distance: f64,
}

/// Outcome of a `refresh` operation.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub status: String,
    pub message: String,
    pub issues_processed: u64,
}

/// One ranked match in a duplicate report.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMatch {
    pub number: i64,
    pub title: String,
    pub similarity: f64,
}

/// Outcome of a `duplicates` query.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub issue_number: i64,
    pub repository: String,
    pub duplicates: Vec<DuplicateMatch>,
}
