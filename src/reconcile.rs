//! Reconciliation of an incoming document batch against a stored collection.
//!
//! One full read of the collection, a map keyed by slug, and set
//! operations between incoming and stored slugs decide what to create,
//! update, and delete. Every write goes through the [`Store`]; there is no
//! transaction around the batch, so a failure leaves earlier writes applied
//! and reports how far the batch got. Re-running with the same input
//! converges.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::models::{Document, EntityType, Summary};
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::store::Store;
use crate::versions::VersionRetention;

static NO_PROGRESS: NoProgress = NoProgress;

/// Applies create/update/delete sets for one entity type.
///
/// ```rust,no_run
/// # use content_sync::reconcile::Reconciler;
/// # use content_sync::models::{Document, EntityType};
/// # use content_sync::store::memory::InMemoryStore;
/// # async fn example() -> Result<(), content_sync::error::SyncError> {
/// let store = InMemoryStore::new();
/// let incoming = vec![Document::new("hello", "body").with_field("title", "Hello")];
/// let summary = Reconciler::new(&store)
///     .reconcile(EntityType::Post, incoming)
///     .await?;
/// assert_eq!(summary.created, 1);
/// # Ok(())
/// # }
/// ```
pub struct Reconciler<'a> {
    store: &'a dyn Store,
    retention: Option<&'a VersionRetention>,
    progress: &'a dyn ProgressSink,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            retention: None,
            progress: &NO_PROGRESS,
            cancel: None,
        }
    }

    /// Snapshot documents authored outside the pipeline before overwriting them.
    pub fn with_retention(mut self, retention: &'a VersionRetention) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Check `cancel` between documents. Without a token the batch always
    /// runs to completion or to the first storage error.
    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn reconcile(
        &self,
        entity: EntityType,
        incoming: Vec<Document>,
    ) -> Result<Summary, SyncError> {
        self.reconcile_at(entity, incoming, Utc::now()).await
    }

    /// Like [`reconcile`](Self::reconcile) with an explicit sync timestamp.
    pub async fn reconcile_at(
        &self,
        entity: EntityType,
        incoming: Vec<Document>,
        now: DateTime<Utc>,
    ) -> Result<Summary, SyncError> {
        let mut summary = Summary::default();

        let existing: HashMap<String, Document> = self
            .store
            .list_by_type(entity)
            .await
            .map_err(|e| SyncError::storage(summary, e))?
            .into_iter()
            .map(|d| (d.slug.clone(), d))
            .collect();

        // Last declared document wins for a repeated slug.
        let mut latest: BTreeMap<String, Document> = BTreeMap::new();
        for doc in incoming {
            let slug = doc.slug.clone();
            if latest.insert(slug.clone(), doc).is_some() {
                tracing::warn!(%entity, %slug, "duplicate slug in incoming batch; keeping the last one");
                summary.skipped += 1;
                self.progress
                    .report(ProgressEvent::Skipped {
                        entity,
                        slug,
                        reason: "duplicate slug, superseded by a later document".to_string(),
                    })
                    .await;
            }
        }

        self.progress
            .report(ProgressEvent::Loaded {
                entity,
                incoming: latest.len(),
                existing: existing.len(),
            })
            .await;

        // Stored, sync-managed, and absent from the batch. Documents without
        // `last_synced_at` are never candidates.
        let mut stale: Vec<&str> = existing
            .values()
            .filter(|d| d.is_sync_managed() && !latest.contains_key(&d.slug))
            .map(|d| d.slug.as_str())
            .collect();
        stale.sort_unstable();

        for (slug, doc) in latest {
            self.check_cancelled(summary)?;

            match existing.get(&slug) {
                Some(stored) if doc.differs_from(stored) => {
                    if !stored.is_sync_managed() {
                        if let Some(retention) = self.retention {
                            retention
                                .snapshot_at(entity.as_str(), &slug, stored, now)
                                .await;
                        }
                    }
                    let kept_embedding = if doc.semantic_text_differs(stored) {
                        None
                    } else {
                        stored.embedding.clone()
                    };
                    let next = Document {
                        embedding: doc.embedding.or(kept_embedding),
                        last_synced_at: Some(now),
                        ..doc
                    };
                    self.write(entity, &next, summary).await?;
                    summary.updated += 1;
                    self.progress
                        .report(ProgressEvent::Updated { entity, slug })
                        .await;
                }
                Some(stored) => {
                    // Unchanged: refresh liveness only, not reported as an update.
                    let mut next = stored.clone();
                    next.last_synced_at = Some(now);
                    self.write(entity, &next, summary).await?;
                    tracing::debug!(%entity, %slug, "unchanged");
                }
                None => {
                    let next = Document {
                        last_synced_at: Some(now),
                        ..doc
                    };
                    self.write(entity, &next, summary).await?;
                    summary.created += 1;
                    self.progress
                        .report(ProgressEvent::Created { entity, slug })
                        .await;
                }
            }
        }

        for slug in stale {
            self.check_cancelled(summary)?;

            self.store
                .delete(entity, slug)
                .await
                .map_err(|e| SyncError::storage(summary, e))?;
            summary.deleted += 1;
            self.progress
                .report(ProgressEvent::Deleted {
                    entity,
                    slug: slug.to_string(),
                })
                .await;
        }

        tracing::info!(%entity, %summary, "reconcile finished");
        self.progress
            .report(ProgressEvent::Reconciled { entity, summary })
            .await;

        Ok(summary)
    }

    async fn write(
        &self,
        entity: EntityType,
        doc: &Document,
        summary: Summary,
    ) -> Result<(), SyncError> {
        self.store.upsert(entity, doc).await.map_err(|e| {
            tracing::warn!(%entity, slug = %doc.slug, error = %e, "write failed; aborting batch");
            SyncError::storage(summary, e)
        })
    }

    fn check_cancelled(&self, summary: Summary) -> Result<(), SyncError> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(SyncError::Cancelled { partial: summary }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn post(slug: &str, body: &str) -> Document {
        Document::new(slug, body)
            .with_field("title", slug.to_uppercase())
            .with_field("date", "2024-01-01")
    }

    #[tokio::test]
    async fn creates_then_is_idempotent() {
        let store = InMemoryStore::new();
        let batch = vec![post("a", "1"), post("b", "2")];

        let first = Reconciler::new(&store)
            .reconcile(EntityType::Post, batch.clone())
            .await
            .unwrap();
        assert_eq!(first.created, 2);

        let before = store.list_by_type(EntityType::Post).await.unwrap();
        let second = Reconciler::new(&store)
            .reconcile(EntityType::Post, batch)
            .await
            .unwrap();
        assert!(second.is_noop(), "{}", second);

        let after = store.list_by_type(EntityType::Post).await.unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(!a.differs_from(b));
        }
    }

    #[tokio::test]
    async fn duplicate_slugs_last_wins() {
        let store = InMemoryStore::new();
        let summary = Reconciler::new(&store)
            .reconcile(
                EntityType::Post,
                vec![post("a", "first"), post("a", "second")],
            )
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        let stored = store.get(EntityType::Post, "a").await.unwrap().unwrap();
        assert_eq!(stored.content, "second");
    }

    #[tokio::test]
    async fn unmanaged_documents_survive_empty_batch() {
        let store = InMemoryStore::new();
        store
            .upsert(EntityType::Page, &Document::new("handmade", "x"))
            .await
            .unwrap();

        let summary = Reconciler::new(&store)
            .reconcile(EntityType::Page, Vec::new())
            .await
            .unwrap();
        assert_eq!(summary.deleted, 0);
        assert!(store
            .get(EntityType::Page, "handmade")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn embedding_kept_unless_semantic_text_changes() {
        let store = InMemoryStore::new();
        Reconciler::new(&store)
            .reconcile(EntityType::Post, vec![post("a", "body"), post("b", "body")])
            .await
            .unwrap();
        store
            .set_embedding(EntityType::Post, "a", &[1.0])
            .await
            .unwrap();
        store
            .set_embedding(EntityType::Post, "b", &[2.0])
            .await
            .unwrap();

        let summary = Reconciler::new(&store)
            .reconcile(
                EntityType::Post,
                vec![
                    post("a", "body").with_field("tags", vec!["x".to_string()]),
                    post("b", "new body"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.updated, 2);

        let a = store.get(EntityType::Post, "a").await.unwrap().unwrap();
        let b = store.get(EntityType::Post, "b").await.unwrap().unwrap();
        assert_eq!(a.embedding, Some(vec![1.0]));
        assert_eq!(b.embedding, None);
    }

    #[tokio::test]
    async fn overwriting_authored_document_snapshots_it_first() {
        let store = Arc::new(InMemoryStore::new());
        let retention = VersionRetention::new(store.clone(), true, Duration::days(3));
        store
            .upsert(EntityType::Post, &post("a", "written by hand"))
            .await
            .unwrap();

        let summary = Reconciler::new(store.as_ref())
            .with_retention(&retention)
            .reconcile(EntityType::Post, vec![post("a", "from disk")])
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(store.snapshot_count(), 1);

        let snaps = retention
            .list("post", "a", Utc::now())
            .await
            .unwrap();
        assert_eq!(snaps[0].content, "written by hand");
        let stored = store.get(EntityType::Post, "a").await.unwrap().unwrap();
        assert!(stored.is_sync_managed());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_write() {
        let store = InMemoryStore::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = Reconciler::new(&store)
            .with_cancel(&token)
            .reconcile(EntityType::Post, vec![post("a", "1")])
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.list_by_type(EntityType::Post).await.unwrap().is_empty());
    }
}
