//! In-memory [`Store`] and [`VersionStore`] for tests and embedding.
//!
//! Uses `BTreeMap` behind `std::sync::RwLock`, so collections iterate in
//! slug order like the SQLite backend.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Document, EntityType, VersionSnapshot};

use super::{Store, VersionStore};

#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<BTreeMap<(EntityType, String), Document>>,
    snapshots: RwLock<BTreeMap<String, VersionSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots across all documents.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().unwrap().len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_by_type(&self, entity: EntityType) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .iter()
            .filter(|((e, _), _)| *e == entity)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get(&self, entity: EntityType, slug: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(&(entity, slug.to_string())).cloned())
    }

    async fn upsert(&self, entity: EntityType, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert((entity, doc.slug.clone()), doc.clone());
        Ok(())
    }

    async fn delete(&self, entity: EntityType, slug: &str) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.remove(&(entity, slug.to_string()));
        Ok(())
    }

    async fn list_missing_embeddings(
        &self,
        entity: EntityType,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .iter()
            .filter(|((e, slug), d)| {
                *e == entity
                    && after.map_or(true, |a| slug.as_str() > a)
                    && d.embedding.is_none()
                    && d.is_publishable()
            })
            .map(|(_, d)| d.clone())
            .take(limit)
            .collect())
    }

    async fn set_embedding(&self, entity: EntityType, slug: &str, vector: &[f64]) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(&(entity, slug.to_string()))
            .ok_or_else(|| anyhow!("{} '{}' not found", entity, slug))?;
        doc.embedding = Some(vector.to_vec());
        Ok(())
    }
}

#[async_trait]
impl VersionStore for InMemoryStore {
    async fn insert_snapshot(&self, snapshot: &VersionSnapshot) -> Result<()> {
        let mut snaps = self.snapshots.write().unwrap();
        snaps.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn list_snapshots(
        &self,
        content_type: &str,
        content_id: &str,
    ) -> Result<Vec<VersionSnapshot>> {
        let snaps = self.snapshots.read().unwrap();
        let mut found: Vec<VersionSnapshot> = snaps
            .values()
            .filter(|s| s.content_type == content_type && s.content_id == content_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<VersionSnapshot>> {
        Ok(self.snapshots.read().unwrap().get(id).cloned())
    }

    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut snaps = self.snapshots.write().unwrap();
        let before = snaps.len();
        snaps.retain(|_, s| s.created_at >= cutoff);
        Ok((before - snaps.len()) as u64)
    }
}
