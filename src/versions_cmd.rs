use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::editor::Editor;
use crate::models::EntityType;
use crate::pipeline::PipelineContext;

/// Print the retained snapshots of one document, newest first.
pub async fn run_versions_list(config: &Config, entity: EntityType, slug: &str) -> Result<()> {
    let ctx = PipelineContext::open(config).await?;
    let snapshots = ctx
        .retention
        .list(entity.as_str(), slug, Utc::now())
        .await?;

    if snapshots.is_empty() {
        println!("No versions for {} '{}'.", entity, slug);
        return Ok(());
    }

    println!("{} versions of {} '{}':", snapshots.len(), entity, slug);
    for snap in snapshots {
        println!(
            "  {}  {}  {}",
            snap.id,
            snap.created_at.format("%Y-%m-%d %H:%M:%S"),
            snap.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

/// Delete snapshots older than the retention window.
pub async fn run_versions_purge(config: &Config) -> Result<()> {
    let ctx = PipelineContext::open(config).await?;
    let deleted = ctx.retention.purge(Utc::now()).await?;
    println!("Purged {} expired versions.", deleted);
    Ok(())
}

/// Put a snapshot back onto its document.
pub async fn run_versions_restore(config: &Config, id: &str) -> Result<()> {
    let ctx = PipelineContext::open(config).await?;
    let doc = Editor::new(ctx.store.as_ref(), &ctx.retention)
        .restore_snapshot(id)
        .await?;
    println!("Restored '{}' from version {}.", doc.slug, id);
    Ok(())
}
