//! Decides which cached issue records need re-embedding.
//!
//! The comparison is purely timestamp-based: an issue is stale when the
//! tracker reports a mutation newer than the one the cached embedding was
//! computed from, or when the cached record's provenance is incomplete.
//! Issues not selected are left untouched.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{CachedState, TrackerIssue};

/// Whether a single issue needs (re-)embedding.
///
/// - `force` wins unconditionally.
/// - A missing record, a record that was never embedded, or one whose
///   tracker timestamp is unknown is always stale.
/// - Otherwise the issue is stale iff the tracker's `updated_at` is strictly
///   newer than the persisted one (both UTC).
pub fn is_stale(force: bool, tracker_updated_at: DateTime<Utc>, cached: Option<&CachedState>) -> bool {
    if force {
        return true;
    }

    let Some(cached) = cached else {
        return true;
    };

    if cached.embedding_refreshed_at.is_none() {
        return true;
    }

    let Some(persisted_updated_at) = cached.tracker_updated_at else {
        return true;
    };

    tracker_updated_at > persisted_updated_at
}

/// Select the subset of `issues` requiring (re-)embedding.
///
/// `cached` maps issue number to the persisted timestamps for the same
/// repository. Order of the input is preserved.
pub fn stale_issues<'a>(
    issues: &'a [TrackerIssue],
    cached: &HashMap<i64, CachedState>,
    force: bool,
) -> Vec<&'a TrackerIssue> {
    issues
        .iter()
        .filter(|issue| is_stale(force, issue.updated_at, cached.get(&issue.number)))
        .collect()
}
