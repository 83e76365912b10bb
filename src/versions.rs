//! Version retention for edited documents.
//!
//! Before a document that did not come from the sync pipeline is changed,
//! its editable state is copied into a [`VersionSnapshot`]. Snapshots live
//! for a fixed window and are removed by [`VersionRetention::purge`], which
//! the server runs periodically and [`VersionRetention::list`] runs lazily.
//!
//! Snapshotting is advisory: a failed write is logged and never fails the
//! edit it precedes. The `enabled` toggle is read on every call, so flipping
//! it takes effect immediately without touching existing snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::VersionsConfig;
use crate::models::{Document, VersionSnapshot};
use crate::store::VersionStore;

pub struct VersionRetention {
    enabled: AtomicBool,
    window: Duration,
    store: Arc<dyn VersionStore>,
}

impl VersionRetention {
    pub fn new(store: Arc<dyn VersionStore>, enabled: bool, window: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            window,
            store,
        }
    }

    pub fn from_config(store: Arc<dyn VersionStore>, config: &VersionsConfig) -> Self {
        Self::new(
            store,
            config.enabled,
            Duration::days(config.retention_days),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            tracing::info!(enabled, "version retention toggled");
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Snapshot `doc` as it is now. Returns the snapshot id when one was written.
    pub async fn snapshot(
        &self,
        content_type: &str,
        content_id: &str,
        doc: &Document,
    ) -> Option<String> {
        self.snapshot_at(content_type, content_id, doc, Utc::now())
            .await
    }

    pub async fn snapshot_at(
        &self,
        content_type: &str,
        content_id: &str,
        doc: &Document,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }

        let snapshot = VersionSnapshot {
            id: Uuid::new_v4().to_string(),
            content_type: content_type.to_string(),
            content_id: content_id.to_string(),
            title: doc.title().map(str::to_string),
            content: doc.content.clone(),
            fields: doc.fields.clone(),
            created_at: now,
        };

        match self.store.insert_snapshot(&snapshot).await {
            Ok(()) => {
                tracing::debug!(content_type, content_id, id = %snapshot.id, "snapshot written");
                Some(snapshot.id)
            }
            Err(e) => {
                tracing::warn!(content_type, content_id, error = %e, "snapshot write failed");
                None
            }
        }
    }

    /// Deletes snapshots older than the retention window as of `now`.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_snapshots_before(now - self.window).await?;
        if deleted > 0 {
            tracing::info!(deleted, "purged expired version snapshots");
        }
        Ok(deleted)
    }

    /// Live snapshots of one document, newest first. Expired ones are purged first.
    pub async fn list(
        &self,
        content_type: &str,
        content_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<VersionSnapshot>> {
        if let Err(e) = self.purge(now).await {
            tracing::warn!(error = %e, "lazy snapshot purge failed");
        }
        self.store.list_snapshots(content_type, content_id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<VersionSnapshot>> {
        self.store.get_snapshot(id).await
    }
}
