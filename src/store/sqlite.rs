//! SQLite-backed [`Store`] and [`VersionStore`].
//!
//! Each method is a single statement against the schema created by
//! [`crate::migrate`], so every write commits on its own.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{Document, EntityType, Fields, Value, VersionSnapshot};

use super::{Store, VersionStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let fields_json: String = row.try_get("fields_json")?;
    let fields: Fields = serde_json::from_str(&fields_json).context("corrupt fields_json")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let last_synced_at: Option<i64> = row.try_get("last_synced_at")?;

    Ok(Document {
        slug: row.try_get("slug")?,
        content: row.try_get("content")?,
        fields,
        embedding: embedding.map(|b| blob_to_vec(&b)),
        last_synced_at: last_synced_at.map(ts_from_millis).transpose()?,
    })
}

fn row_to_snapshot(row: &SqliteRow) -> Result<VersionSnapshot> {
    let fields_json: String = row.try_get("fields_json")?;
    Ok(VersionSnapshot {
        id: row.try_get("id")?,
        content_type: row.try_get("content_type")?,
        content_id: row.try_get("content_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        fields: serde_json::from_str(&fields_json).context("corrupt snapshot fields_json")?,
        created_at: ts_from_millis(row.try_get("created_at")?)?,
    })
}

/// JSON has no NaN or infinity; serde_json would write `null`, which no
/// longer reads back as a [`Value`].
fn encode_fields(fields: &Fields) -> Result<String> {
    if let Some((name, _)) = fields
        .iter()
        .find(|(_, v)| matches!(v, Value::Number(n) if !n.is_finite()))
    {
        return Err(anyhow!("field '{}' is not a finite number", name));
    }
    Ok(serde_json::to_string(fields)?)
}

const DOCUMENT_COLUMNS: &str = "slug, content, fields_json, embedding, last_synced_at";

#[async_trait]
impl Store for SqliteStore {
    async fn list_by_type(&self, entity: EntityType) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE entity_type = ? ORDER BY slug",
            DOCUMENT_COLUMNS
        ))
        .bind(entity.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn get(&self, entity: EntityType, slug: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE entity_type = ? AND slug = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(entity.as_str())
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn upsert(&self, entity: EntityType, doc: &Document) -> Result<()> {
        let fields_json = encode_fields(&doc.fields)?;
        let embedding = doc.embedding.as_deref().map(vec_to_blob);

        sqlx::query(
            r#"
            INSERT INTO documents (entity_type, slug, content, fields_json, embedding, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_type, slug) DO UPDATE SET
                content = excluded.content,
                fields_json = excluded.fields_json,
                embedding = excluded.embedding,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(entity.as_str())
        .bind(&doc.slug)
        .bind(&doc.content)
        .bind(&fields_json)
        .bind(embedding)
        .bind(doc.last_synced_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, entity: EntityType, slug: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE entity_type = ? AND slug = ?")
            .bind(entity.as_str())
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_missing_embeddings(
        &self,
        entity: EntityType,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        // Matches Document::is_publishable: only boolean draft/published flags count.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM documents
            WHERE entity_type = ?
              AND embedding IS NULL
              AND COALESCE(json_type(fields_json, '$.draft'), '') != 'true'
              AND COALESCE(json_type(fields_json, '$.published'), '') != 'false'
              AND (? IS NULL OR slug > ?)
            ORDER BY slug
            LIMIT ?
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(entity.as_str())
        .bind(after)
        .bind(after)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn set_embedding(&self, entity: EntityType, slug: &str, vector: &[f64]) -> Result<()> {
        let result =
            sqlx::query("UPDATE documents SET embedding = ? WHERE entity_type = ? AND slug = ?")
                .bind(vec_to_blob(vector))
                .bind(entity.as_str())
                .bind(slug)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("{} '{}' not found", entity, slug));
        }
        Ok(())
    }
}

#[async_trait]
impl VersionStore for SqliteStore {
    async fn insert_snapshot(&self, snapshot: &VersionSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO version_snapshots (id, content_type, content_id, title, content, fields_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.content_type)
        .bind(&snapshot.content_id)
        .bind(&snapshot.title)
        .bind(&snapshot.content)
        .bind(encode_fields(&snapshot.fields)?)
        .bind(snapshot.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        content_type: &str,
        content_id: &str,
    ) -> Result<Vec<VersionSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content_type, content_id, title, content, fields_json, created_at
            FROM version_snapshots
            WHERE content_type = ? AND content_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(content_type)
        .bind(content_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_snapshot).collect()
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<VersionSnapshot>> {
        let row = sqlx::query(
            "SELECT id, content_type, content_id, title, content, fields_json, created_at FROM version_snapshots WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM version_snapshots WHERE created_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
