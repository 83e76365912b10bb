//! # Content Sync
//!
//! Keeps a store of markdown documents in step with a content directory.
//!
//! Each entity type (posts, pages) is reconciled as a whole batch: documents
//! are created, updated or deleted so the store matches the source, while
//! documents authored through other entry points are left alone. Stored
//! documents are then given embedding vectors in bounded batches, and edits
//! to authored documents are kept as short-lived version snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Markdown   │──▶│  Reconcile  │──▶│  SQLite  │
//! │  content/   │   │  + Backfill │   │  Store   │
//! └─────────────┘   └──────┬──────┘   └────┬─────┘
//!                          │               │
//!                   ┌──────┴──────┐   ┌────┴─────┐
//!                   │ SyncRunner  │   │ Versions │
//!                   │ (1 at once) │   │ + Editor │
//!                   └──────┬──────┘   └────┬─────┘
//!                      ┌───┴───────────────┤
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │   HTTP   │
//!                 │ (csync)  │       │  server  │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csync init                        # create database
//! csync sync reconcile-posts        # load content/posts
//! csync sync sync-all               # every collection, then embeddings
//! csync versions list page about    # edit history of one page
//! csync serve                       # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Documents, field values, summaries, snapshots |
//! | [`schema`] | Per-entity field validation |
//! | [`source`] | Markdown directory source |
//! | [`store`] | Storage traits with SQLite and in-memory backends |
//! | [`reconcile`] | Batch reconciliation |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`backfill`] | Embedding backfill |
//! | [`versions`] | Version retention |
//! | [`editor`] | Authoring path with snapshots |
//! | [`pipeline`] | Named steps |
//! | [`runner`] | Single-flight sync sessions |
//! | [`server`] | HTTP transport |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backfill;
pub mod config;
pub mod db;
pub mod editor;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod runner;
pub mod schema;
pub mod server;
pub mod source;
pub mod store;
pub mod sync_cmd;
pub mod versions;
pub mod versions_cmd;
