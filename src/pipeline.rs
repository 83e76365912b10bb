//! Named pipeline steps.
//!
//! A [`Step`] is the unit an operator triggers: reconcile one collection,
//! backfill embeddings, purge expired snapshots, or all of the sync work in
//! sequence. [`run_step`] executes one against a [`PipelineContext`] and
//! checks the cancellation token between discrete units of work (documents,
//! collections, backfill batches), never inside a single storage write.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backfill::{BackfillReport, Backfiller};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::SyncError;
use crate::migrate;
use crate::models::{EntityType, Summary};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::reconcile::Reconciler;
use crate::source::{DocumentSource, MarkdownDirSource};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::versions::VersionRetention;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Reconcile(EntityType),
    BackfillEmbeddings,
    PurgeVersions,
    /// Reconcile every collection, then backfill.
    SyncAll,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Reconcile(EntityType::Post),
        Step::Reconcile(EntityType::Page),
        Step::BackfillEmbeddings,
        Step::PurgeVersions,
        Step::SyncAll,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Reconcile(EntityType::Post) => "reconcile-posts",
            Step::Reconcile(EntityType::Page) => "reconcile-pages",
            Step::BackfillEmbeddings => "backfill-embeddings",
            Step::PurgeVersions => "purge-versions",
            Step::SyncAll => "sync-all",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match Step::ALL.iter().find(|step| step.name() == s) {
            Some(step) => Ok(*step),
            None => {
                let names: Vec<&str> = Step::ALL.iter().map(|s| s.name()).collect();
                bail!("Unknown step: '{}'. Available: {}", s, names.join(", "))
            }
        }
    }
}

/// Everything a step needs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub source: Arc<dyn DocumentSource>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub retention: Arc<VersionRetention>,
}

impl PipelineContext {
    /// Wire up the SQLite store (migrated if needed), the markdown source,
    /// and the configured embedding provider.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let sqlite = Arc::new(SqliteStore::new(pool));
        let provider = create_provider(&config.embedding)?;
        let retention = Arc::new(VersionRetention::from_config(
            sqlite.clone(),
            &config.versions,
        ));

        Ok(Self {
            config: Arc::new(config.clone()),
            store: sqlite,
            source: Arc::new(MarkdownDirSource::new(config.content.clone())),
            provider,
            retention,
        })
    }
}

pub async fn run_step(
    ctx: &PipelineContext,
    step: Step,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<Summary, SyncError> {
    match step {
        Step::Reconcile(entity) => reconcile_entity(ctx, entity, progress, cancel).await,
        Step::BackfillEmbeddings => backfill_embeddings(ctx, progress, cancel)
            .await
            .map(|_| Summary::default()),
        Step::PurgeVersions => purge_versions(ctx, progress).await,
        Step::SyncAll => {
            let mut total = Summary::default();
            for entity in EntityType::ALL {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled { partial: total });
                }
                let summary = reconcile_entity(ctx, entity, progress, cancel)
                    .await
                    .map_err(|e| e.with_prior(total))?;
                total.merge(summary);
            }
            backfill_embeddings(ctx, progress, cancel)
                .await
                .map_err(|e| e.with_prior(total))?;
            Ok(total)
        }
    }
}

async fn reconcile_entity(
    ctx: &PipelineContext,
    entity: EntityType,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<Summary, SyncError> {
    let batch = ctx.source.load(entity).await.map_err(SyncError::Source)?;

    let mut rejected = Summary::default();
    for r in &batch.rejected {
        rejected.skipped += 1;
        progress
            .report(ProgressEvent::Skipped {
                entity,
                slug: r.path.display().to_string(),
                reason: r.reason.clone(),
            })
            .await;
    }

    let mut summary = Reconciler::new(ctx.store.as_ref())
        .with_retention(&ctx.retention)
        .with_progress(progress)
        .with_cancel(cancel)
        .reconcile(entity, batch.documents)
        .await
        .map_err(|e| e.with_prior(rejected))?;
    summary.merge(rejected);
    Ok(summary)
}

/// Vector counts go to the progress stream only; see [`crate::backfill`].
async fn backfill_embeddings(
    ctx: &PipelineContext,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<BackfillReport, SyncError> {
    if !ctx.provider.is_enabled() {
        progress
            .report(ProgressEvent::Message(
                "embeddings disabled; skipping backfill".to_string(),
            ))
            .await;
        return Ok(BackfillReport::default());
    }

    let backfiller = Backfiller::new(ctx.store.as_ref(), ctx.provider.as_ref(), &ctx.config.embedding)
        .with_progress(progress);
    let mut total = BackfillReport::default();
    for entity in EntityType::ALL {
        let report = backfiller
            .backfill_all(entity, ctx.config.embedding.batch_size, Some(cancel))
            .await?;
        total.merge(report);
    }
    progress
        .report(ProgressEvent::Message(format!(
            "backfill done  embedded {}  failed {}",
            total.processed, total.failed
        )))
        .await;
    Ok(total)
}

async fn purge_versions(
    ctx: &PipelineContext,
    progress: &dyn ProgressSink,
) -> Result<Summary, SyncError> {
    let deleted = ctx
        .retention
        .purge(Utc::now())
        .await
        .map_err(|e| SyncError::storage(Summary::default(), e))?;
    progress
        .report(ProgressEvent::Message(format!(
            "purged {} expired snapshots",
            deleted
        )))
        .await;
    Ok(Summary {
        deleted,
        ..Default::default()
    })
}
