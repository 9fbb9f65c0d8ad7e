//! # Triage Harness CLI (`triage`)
//!
//! The `triage` binary is the primary interface for Triage Harness. It
//! provides commands for schema initialization, embedding refresh, duplicate
//! lookup, and starting the MCP-compatible tool server.
//!
//! ## Usage
//!
//! ```bash
//! triage --config ./config/triage.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `triage init` | Create the issues table, vector extension, and index |
//! | `triage refresh <owner> <name>` | Sync embeddings for all open issues |
//! | `triage duplicates <owner> <name> <number>` | Rank near-duplicates of one issue |
//! | `triage serve mcp` | Start the MCP-compatible HTTP tool server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database (idempotent)
//! triage init --config ./config/triage.toml
//!
//! # Refresh embeddings, re-embedding only stale issues
//! triage refresh google-gemini gemini-cli
//!
//! # Force a full re-embed
//! triage refresh google-gemini gemini-cli --force
//!
//! # Find duplicates of issue #1234 at the default threshold
//! triage duplicates google-gemini gemini-cli 1234
//!
//! # Stricter matching
//! triage duplicates google-gemini gemini-cli 1234 --threshold 0.95
//! ```
//!
//! Secrets come from the environment: `GITHUB_TOKEN` for the tracker,
//! `GEMINI_API_KEY` for the embedding service.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use triage_harness::{config, db, dedup, embedding, server, store::PgIssueStore, sync, tracker};

/// Triage Harness CLI — a semantic duplicate-detection engine and embedding
/// cache for issue trackers.
#[derive(Parser)]
#[command(
    name = "triage",
    about = "Triage Harness — semantic duplicate detection for issue trackers",
    version,
    long_about = "Triage Harness maintains a Postgres/pgvector cache of issue embeddings, \
    syncs it incrementally against the tracker, and ranks near-duplicate issues by cosine \
    distance via a CLI and an MCP-compatible HTTP tool server."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/triage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the vector extension, the issues table, and the approximate
    /// similarity index. This command is idempotent — running it multiple
    /// times is safe.
    Init,

    /// Sync embeddings for all open issues of a repository.
    ///
    /// Fetches the latest state of all open issues from the tracker,
    /// re-embeds the ones updated since their last refresh, and stores them.
    /// Prints the refresh report as JSON.
    Refresh {
        /// Repository owner, e.g. `google-gemini`.
        owner: String,

        /// Repository name, e.g. `gemini-cli`.
        name: String,

        /// Re-embed all issues, ignoring staleness.
        #[arg(long)]
        force: bool,
    },

    /// Find duplicate issues for a given issue.
    ///
    /// Ensures the target issue's embedding is current, then prints the
    /// ranked duplicate report as JSON.
    Duplicates {
        /// Repository owner.
        owner: String,

        /// Repository name.
        name: String,

        /// Issue number to find duplicates for.
        number: i64,

        /// Similarity threshold in [0, 1]; higher is stricter.
        #[arg(long, default_value_t = 0.9)]
        threshold: f64,
    },

    /// Start the MCP-compatible HTTP tool server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the MCP tool server on the address in `[server].bind`.
    Mcp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            triage_harness::migrate::run_migrations(&pool, cfg.embedding.dims).await?;
            println!("Database initialized successfully.");
        }
        Commands::Refresh { owner, name, force } => {
            let repo = format!("{}/{}", owner, name);
            let pool = db::connect(&cfg).await?;
            let store = PgIssueStore::new(pool, cfg.embedding.dims);
            let github = tracker::GitHubClient::new(&cfg.tracker)?;
            let embedder = embedding::create_service(&cfg.embedding)?;

            let report =
                sync::run_refresh(&github, embedder.as_ref(), &store, &cfg, &repo, force).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Duplicates {
            owner,
            name,
            number,
            threshold,
        } => {
            let repo = format!("{}/{}", owner, name);
            let pool = db::connect(&cfg).await?;
            let store = PgIssueStore::new(pool, cfg.embedding.dims);
            let github = tracker::GitHubClient::new(&cfg.tracker)?;
            let embedder = embedding::create_service(&cfg.embedding)?;

            match dedup::find_duplicates(
                &github,
                embedder.as_ref(),
                &store,
                &cfg,
                &repo,
                number,
                threshold,
            )
            .await
            {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(e) => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "error": e.to_string() }))?
                ),
            }
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}
