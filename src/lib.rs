//! # Triage Harness
//!
//! A semantic duplicate-detection engine and embedding cache for issue
//! trackers.
//!
//! Triage Harness maintains a Postgres/pgvector cache of issue embeddings
//! and answers "find near-duplicate issues" queries by cosine distance. It
//! syncs the cache incrementally — only issues the tracker has touched since
//! their last embedding are re-embedded — and exposes the two operations via
//! a CLI and an MCP-compatible HTTP tool server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌───────────┐
//! │   GitHub    │──▶│     Pipeline     │──▶│  Postgres  │
//! │  (GraphQL)  │   │ Normalize+Embed  │   │  pgvector  │
//! └─────────────┘   └──────────────────┘   └─────┬─────┘
//!                                                │
//!                            ┌───────────────────┤
//!                            ▼                   ▼
//!                       ┌──────────┐       ┌──────────┐
//!                       │   CLI    │       │   HTTP   │
//!                       │ (triage) │       │  (MCP)   │
//!                       └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! triage init                         # create database schema
//! triage refresh google-gemini gemini-cli
//! triage duplicates google-gemini gemini-cli 1234
//! triage serve mcp                    # start HTTP tool server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`normalize`] | Canonical text construction |
//! | [`staleness`] | Re-embedding decision |
//! | [`retry`] | Rate-limit backoff policy |
//! | [`embedding`] | Embedding service abstraction |
//! | [`tracker`] | Issue-tracker client abstraction |
//! | [`store`] | Persistence layer (Postgres + pgvector) |
//! | [`sync`] | Refresh operation and embedding pipeline |
//! | [`dedup`] | Duplicate resolver |
//! | [`server`] | MCP-compatible HTTP tool server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod retry;
pub mod server;
pub mod staleness;
pub mod store;
pub mod sync;
pub mod tracker;
