use anyhow::{bail, Result};

use crate::backfill::{BackfillReport, Backfiller};
use crate::config::Config;
use crate::models::EntityType;
use crate::pipeline::PipelineContext;
use crate::progress::StderrProgress;

/// Embed every stored document that has no vector yet.
///
/// Runs batches until one stores nothing, for `entity` or for every
/// collection when `None`.
pub async fn run_embed_pending(
    config: &Config,
    entity: Option<EntityType>,
    batch_size_override: Option<usize>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let ctx = PipelineContext::open(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    if batch_size == 0 {
        bail!("--batch-size must be greater than zero");
    }

    let entities: Vec<EntityType> = match entity {
        Some(e) => vec![e],
        None => EntityType::ALL.to_vec(),
    };

    let progress = StderrProgress;
    let backfiller = Backfiller::new(ctx.store.as_ref(), ctx.provider.as_ref(), &config.embedding)
        .with_progress(&progress);

    let mut total = BackfillReport::default();
    for entity in entities {
        let report = backfiller.backfill_all(entity, batch_size, None).await?;
        println!(
            "  {}: embedded {}, failed {}",
            entity.collection(),
            report.processed,
            report.failed
        );
        total.merge(report);
    }

    println!("embed pending");
    println!("  model: {}", ctx.provider.model_name());
    println!("  embedded: {}", total.processed);
    println!("  failed: {}", total.failed);
    Ok(())
}
