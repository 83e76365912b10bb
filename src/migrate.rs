use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates all tables and indexes. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Documents, one row per (entity type, slug). Timestamps are unix millis.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            entity_type TEXT NOT NULL,
            slug TEXT NOT NULL,
            content TEXT NOT NULL,
            fields_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            last_synced_at INTEGER,
            PRIMARY KEY (entity_type, slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS version_snapshots (
            id TEXT PRIMARY KEY,
            content_type TEXT NOT NULL,
            content_id TEXT NOT NULL,
            title TEXT,
            content TEXT NOT NULL,
            fields_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Backfill scans for rows without a vector
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_missing_embedding ON documents(entity_type, slug) WHERE embedding IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_content ON version_snapshots(content_type, content_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_created_at ON version_snapshots(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
