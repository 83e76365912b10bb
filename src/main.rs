//! # Content Sync CLI (`csync`)
//!
//! Reconciles a directory of markdown content into the document store,
//! backfills embeddings, and manages edit history.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the SQLite database and run schema migrations |
//! | `csync sync <step>` | Run a pipeline step and stream its progress |
//! | `csync embed pending` | Embed documents that have no vector yet |
//! | `csync versions list <entity> <slug>` | Show retained versions of a document |
//! | `csync versions purge` | Delete versions past the retention window |
//! | `csync versions restore <id>` | Restore a version onto its document |
//! | `csync serve` | Start the HTTP server |
//!
//! Steps: `reconcile-posts`, `reconcile-pages`, `backfill-embeddings`,
//! `purge-versions`, `sync-all`.
//!
//! Logs go to stderr and honor `RUST_LOG`; stdout carries command output
//! only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use content_sync::models::EntityType;
use content_sync::pipeline::Step;
use content_sync::{config, embed_cmd, migrate, server, sync_cmd, versions_cmd};

/// Content Sync CLI: markdown reconciliation, embedding backfill, and
/// version retention.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Content Sync: reconcile markdown content into a document store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run a pipeline step, printing its progress stream.
    ///
    /// Exits non-zero unless the run ends with `status=succeeded`.
    Sync {
        /// One of `reconcile-posts`, `reconcile-pages`, `backfill-embeddings`,
        /// `purge-versions`, `sync-all`.
        step: Step,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Inspect and manage retained document versions.
    Versions {
        #[command(subcommand)]
        action: VersionsAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed stored documents that have no vector yet.
    Pending {
        /// Only this collection (`post` or `page`).
        #[arg(long)]
        entity: Option<EntityType>,

        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum VersionsAction {
    /// List versions of a document, newest first.
    List { entity: EntityType, slug: String },
    /// Delete versions older than the retention window.
    Purge,
    /// Restore a version onto its document.
    Restore { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("content_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { step } => {
            sync_cmd::run_sync(&cfg, step).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { entity, batch_size } => {
                embed_cmd::run_embed_pending(&cfg, entity, batch_size).await?;
            }
        },
        Commands::Versions { action } => match action {
            VersionsAction::List { entity, slug } => {
                versions_cmd::run_versions_list(&cfg, entity, &slug).await?;
            }
            VersionsAction::Purge => {
                versions_cmd::run_versions_purge(&cfg).await?;
            }
            VersionsAction::Restore { id } => {
                versions_cmd::run_versions_restore(&cfg, &id).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
