//! Direct editing path for documents authored outside the sync pipeline.
//!
//! Documents created here have no `last_synced_at`, so reconciliation never
//! deletes them. Editing such a document snapshots its previous state first.
//! Sync-managed documents can be edited too, but the next sync will put the
//! source version back, so no snapshot is taken for them.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::EditError;
use crate::models::{Document, EntityType, Value};
use crate::schema;
use crate::store::Store;
use crate::versions::VersionRetention;

/// A partial update. Absent parts are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentEdit {
    #[serde(default)]
    pub content: Option<String>,
    /// Fields to set or overwrite.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Fields to remove.
    #[serde(default)]
    pub remove_fields: Vec<String>,
}

pub struct Editor<'a> {
    store: &'a dyn Store,
    retention: &'a VersionRetention,
}

impl<'a> Editor<'a> {
    pub fn new(store: &'a dyn Store, retention: &'a VersionRetention) -> Self {
        Self { store, retention }
    }

    /// Store a new authored document. Fails if the slug is taken.
    pub async fn create_document(
        &self,
        entity: EntityType,
        mut doc: Document,
    ) -> Result<Document, EditError> {
        schema::validate(entity, &doc).map_err(|e| EditError::Invalid(format!("{:#}", e)))?;

        if self.store.get(entity, &doc.slug).await?.is_some() {
            return Err(EditError::AlreadyExists {
                entity: entity.to_string(),
                slug: doc.slug,
            });
        }

        doc.last_synced_at = None;
        doc.embedding = None;
        self.store.upsert(entity, &doc).await?;
        tracing::info!(%entity, slug = %doc.slug, "document created");
        Ok(doc)
    }

    /// Apply `edit` to the stored document, snapshotting it first when it
    /// was not created by the sync pipeline.
    pub async fn edit_document(
        &self,
        entity: EntityType,
        slug: &str,
        edit: DocumentEdit,
    ) -> Result<Document, EditError> {
        let current = self
            .store
            .get(entity, slug)
            .await?
            .ok_or_else(|| EditError::NotFound {
                entity: entity.to_string(),
                slug: slug.to_string(),
            })?;

        let mut next = current.clone();
        if let Some(content) = edit.content {
            next.content = content;
        }
        for key in &edit.remove_fields {
            next.fields.remove(key);
        }
        next.fields.extend(edit.fields);

        schema::validate(entity, &next).map_err(|e| EditError::Invalid(format!("{:#}", e)))?;

        if !next.differs_from(&current) {
            return Ok(current);
        }

        if !current.is_sync_managed() {
            self.retention
                .snapshot(entity.as_str(), slug, &current)
                .await;
        }

        if next.semantic_text_differs(&current) {
            next.embedding = None;
        }
        self.store.upsert(entity, &next).await?;
        tracing::info!(%entity, %slug, "document edited");
        Ok(next)
    }

    /// Put a snapshot's content and fields back onto its document. The
    /// current state is itself snapshotted by the edit.
    pub async fn restore_snapshot(&self, id: &str) -> Result<Document, EditError> {
        let snapshot = self
            .retention
            .get(id)
            .await?
            .ok_or_else(|| EditError::SnapshotNotFound(id.to_string()))?;
        let entity: EntityType = snapshot
            .content_type
            .parse()
            .map_err(|e: anyhow::Error| EditError::Invalid(e.to_string()))?;

        let current = self
            .store
            .get(entity, &snapshot.content_id)
            .await?
            .ok_or_else(|| EditError::NotFound {
                entity: entity.to_string(),
                slug: snapshot.content_id.clone(),
            })?;

        let edit = DocumentEdit {
            content: Some(snapshot.content),
            remove_fields: current.fields.keys().cloned().collect(),
            fields: snapshot.fields,
        };
        self.edit_document(entity, &snapshot.content_id, edit).await
    }
}
