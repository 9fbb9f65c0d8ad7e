//! Issue-tracker client abstraction and GitHub implementation.
//!
//! The engine only ever needs two things from the tracker: the set of open
//! issue numbers (with their last-modified timestamps) and full details for
//! a batch of issue numbers. [`TrackerClient`] captures exactly that, so the
//! core pipeline is independent of the transport.
//!
//! [`GitHubClient`] implements the trait over the GitHub GraphQL API:
//! listing paginates through open issues; detail fetches use one aliased
//! query per batch (default 100 issues per request) to bound request size.
//! A failed detail batch is logged and skipped — partial results are
//! returned, and nothing is retried.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;

use crate::config::TrackerConfig;
use crate::models::{IssueRef, TrackerIssue};

/// Narrow interface to the upstream issue tracker.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// All open issue numbers in `repo` (`"owner/name"`), with their
    /// last-modified timestamps.
    async fn list_open_issue_numbers(&self, repo: &str) -> Result<Vec<IssueRef>>;

    /// Full state for the given issue numbers. Numbers the tracker does not
    /// know, and batches that fail outright, are absent from the result.
    async fn fetch_issues(&self, repo: &str, numbers: &[i64]) -> Result<Vec<TrackerIssue>>;
}

/// GitHub GraphQL implementation of [`TrackerClient`].
///
/// Requires the `GITHUB_TOKEN` environment variable.
pub struct GitHubClient {
    graphql_url: String,
    token: String,
    batch_size: usize,
    comment_limit: usize,
    client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .map_err(|_| anyhow::anyhow!("GITHUB_TOKEN environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("triage-harness/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            graphql_url: config.graphql_url.clone(),
            token,
            batch_size: config.batch_size,
            comment_limit: config.comment_limit,
            client,
        })
    }

    async fn graphql(&self, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.graphql_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("GraphQL request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            anyhow::bail!("GraphQL request returned {}: {}", status, body_text);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("GraphQL response was not valid JSON")?;

        if let Some(errors) = json.get("errors") {
            anyhow::bail!("GraphQL API error: {}", errors);
        }

        Ok(json)
    }
}

#[async_trait]
impl TrackerClient for GitHubClient {
    async fn list_open_issue_numbers(&self, repo: &str) -> Result<Vec<IssueRef>> {
        let (owner, name) = split_repo(repo)?;

        let query = r#"
            query($owner: String!, $name: String!, $cursor: String) {
                repository(owner: $owner, name: $name) {
                    issues(states: OPEN, first: 100, after: $cursor) {
                        pageInfo { hasNextPage endCursor }
                        nodes { number updatedAt }
                    }
                }
            }
        "#;

        let mut refs = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = json!({
                "query": query,
                "variables": { "owner": owner, "name": name, "cursor": cursor },
            });

            let response = self.graphql(body).await?;
            let (page, next) = parse_list_page(&response)?;
            refs.extend(page);

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok(refs)
    }

    async fn fetch_issues(&self, repo: &str, numbers: &[i64]) -> Result<Vec<TrackerIssue>> {
        let (owner, name) = split_repo(repo)?;
        let mut issues = Vec::with_capacity(numbers.len());

        for batch in numbers.chunks(self.batch_size) {
            let query_parts: Vec<String> = batch
                .iter()
                .map(|n| {
                    format!(
                        "issue_{n}: issue(number: {n}) {{ title body updatedAt \
                         comments(first: {limit}) {{ nodes {{ body }} }} }}",
                        n = n,
                        limit = self.comment_limit
                    )
                })
                .collect();

            let full_query = format!(
                "query {{ repository(owner: \"{}\", name: \"{}\") {{ {} }} }}",
                owner,
                name,
                query_parts.join(" ")
            );

            let response = match self.graphql(json!({ "query": full_query })).await {
                Ok(r) => r,
                Err(e) => {
                    eprintln!(
                        "Warning: detail fetch failed for batch starting with #{}: {}",
                        batch[0], e
                    );
                    continue;
                }
            };

            let repo_data = &response["data"]["repository"];
            for number in batch {
                if let Some(issue) = parse_issue_node(*number, &repo_data[format!("issue_{}", number)])
                {
                    issues.push(issue);
                }
            }
        }

        Ok(issues)
    }
}

fn split_repo(repo: &str) -> Result<(&str, &str)> {
    repo.split_once('/')
        .with_context(|| format!("repository must be 'owner/name', got '{}'", repo))
}

/// Parse one page of the open-issue listing.
///
/// Returns the refs plus the cursor for the next page, if any.
fn parse_list_page(json: &serde_json::Value) -> Result<(Vec<IssueRef>, Option<String>)> {
    let issues = &json["data"]["repository"]["issues"];

    let nodes = issues["nodes"]
        .as_array()
        .context("invalid listing response: missing issues.nodes")?;

    let mut refs = Vec::with_capacity(nodes.len());
    for node in nodes {
        let number = node["number"]
            .as_i64()
            .context("invalid listing response: missing issue number")?;
        let updated_at = parse_timestamp(&node["updatedAt"])
            .context("invalid listing response: missing updatedAt")?;
        refs.push(IssueRef { number, updated_at });
    }

    let page_info = &issues["pageInfo"];
    let next_cursor = if page_info["hasNextPage"].as_bool().unwrap_or(false) {
        page_info["endCursor"].as_str().map(|s| s.to_string())
    } else {
        None
    };

    Ok((refs, next_cursor))
}

/// Parse an aliased `issue_{n}` node from a detail-fetch response.
///
/// Returns `None` when the tracker has no such issue (null node) or the
/// node is malformed.
fn parse_issue_node(number: i64, node: &serde_json::Value) -> Option<TrackerIssue> {
    if node.is_null() {
        return None;
    }

    let title = node["title"].as_str()?.to_string();
    let body = node["body"].as_str().unwrap_or("").to_string();
    let updated_at = parse_timestamp(&node["updatedAt"])?;

    let comments = node["comments"]["nodes"]
        .as_array()
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|c| c["body"].as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    Some(TrackerIssue {
        number,
        title,
        body,
        updated_at,
        comments,
    })
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
