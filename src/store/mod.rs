//! Storage abstraction for content-sync.
//!
//! The [`Store`] trait is the document collection the reconciler, backfill
//! scheduler, and editing path work against. [`VersionStore`] holds version
//! snapshots. Backends provide atomic single-document reads and writes but
//! no multi-document transactions.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Document, EntityType, VersionSnapshot};

/// Abstract document collection, one per entity type.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list_by_type`](Store::list_by_type) | Full read of a collection |
/// | [`get`](Store::get) | Point read by slug |
/// | [`upsert`](Store::upsert) | Insert or replace a document |
/// | [`delete`](Store::delete) | Remove a document by slug |
/// | [`list_missing_embeddings`](Store::list_missing_embeddings) | Publishable documents without a vector |
/// | [`set_embedding`](Store::set_embedding) | Attach a vector to a document |
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_by_type(&self, entity: EntityType) -> Result<Vec<Document>>;

    async fn get(&self, entity: EntityType, slug: &str) -> Result<Option<Document>>;

    /// Insert or fully replace the document with `doc.slug`, including its
    /// embedding and `last_synced_at`.
    async fn upsert(&self, entity: EntityType, doc: &Document) -> Result<()>;

    /// Deleting a missing slug is not an error.
    async fn delete(&self, entity: EntityType, slug: &str) -> Result<()>;

    /// Up to `limit` publishable documents that have no embedding, in slug
    /// order, starting strictly after `after` when given.
    async fn list_missing_embeddings(
        &self,
        entity: EntityType,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    async fn set_embedding(&self, entity: EntityType, slug: &str, vector: &[f64]) -> Result<()>;
}

/// Storage for version snapshots.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &VersionSnapshot) -> Result<()>;

    /// Snapshots of one document, newest first.
    async fn list_snapshots(
        &self,
        content_type: &str,
        content_id: &str,
    ) -> Result<Vec<VersionSnapshot>>;

    async fn get_snapshot(&self, id: &str) -> Result<Option<VersionSnapshot>>;

    /// Deletes snapshots created strictly before `cutoff`. Returns the count.
    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
