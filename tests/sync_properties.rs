//! Library-level tests for reconciliation, backfill and sync sessions,
//! run against the in-memory store with fake sources and providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use tokio::sync::Semaphore;

use content_sync::backfill::Backfiller;
use content_sync::config::{Config, EmbeddingConfig};
use content_sync::embedding::{DisabledProvider, EmbeddingProvider};
use content_sync::error::{ProviderError, RunnerError, SyncError};
use content_sync::models::{Document, EntityType, Summary};
use content_sync::pipeline::{PipelineContext, Step};
use content_sync::reconcile::Reconciler;
use content_sync::runner::{parse_terminal_line, SyncRunner};
use content_sync::source::{DocumentSource, IncomingBatch};
use content_sync::store::memory::InMemoryStore;
use content_sync::store::Store;
use content_sync::versions::VersionRetention;

// ============ Fakes ============

fn post(slug: &str, body: &str) -> Document {
    Document::new(slug, body)
        .with_field("title", format!("Title {}", slug))
        .with_field("date", "2024-01-01")
}

/// Serves fixed batches. With a gate, every load waits for a permit.
struct FixedSource {
    batches: Mutex<HashMap<EntityType, Vec<Document>>>,
    gate: Option<Arc<Semaphore>>,
}

impl FixedSource {
    fn new(posts: Vec<Document>) -> Self {
        let mut batches = HashMap::new();
        batches.insert(EntityType::Post, posts);
        Self {
            batches: Mutex::new(batches),
            gate: None,
        }
    }

    fn gated(posts: Vec<Document>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(posts)
        }
    }
}

#[async_trait]
impl DocumentSource for FixedSource {
    async fn load(&self, entity: EntityType) -> Result<IncomingBatch> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        let documents = self
            .batches
            .lock()
            .unwrap()
            .get(&entity)
            .cloned()
            .unwrap_or_default();
        Ok(IncomingBatch {
            documents,
            rejected: Vec::new(),
        })
    }
}

/// Delegates to an in-memory store but fails every upsert after the first
/// `ok_writes`.
struct FailingStore {
    inner: InMemoryStore,
    ok_writes: usize,
    writes: AtomicUsize,
}

impl FailingStore {
    fn new(ok_writes: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            ok_writes,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn list_by_type(&self, entity: EntityType) -> Result<Vec<Document>> {
        self.inner.list_by_type(entity).await
    }
    async fn get(&self, entity: EntityType, slug: &str) -> Result<Option<Document>> {
        self.inner.get(entity, slug).await
    }
    async fn upsert(&self, entity: EntityType, doc: &Document) -> Result<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
            return Err(anyhow!("disk I/O error"));
        }
        self.inner.upsert(entity, doc).await
    }
    async fn delete(&self, entity: EntityType, slug: &str) -> Result<()> {
        self.inner.delete(entity, slug).await
    }
    async fn list_missing_embeddings(
        &self,
        entity: EntityType,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.inner.list_missing_embeddings(entity, after, limit).await
    }
    async fn set_embedding(&self, entity: EntityType, slug: &str, vector: &[f64]) -> Result<()> {
        self.inner.set_embedding(entity, slug, vector).await
    }
}

struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn model_name(&self) -> &str {
        "counting"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![text.len() as f64, 1.0])
    }
}

fn context(store: Arc<InMemoryStore>, source: FixedSource) -> PipelineContext {
    PipelineContext {
        config: Arc::new(Config::minimal()),
        retention: Arc::new(VersionRetention::new(
            store.clone(),
            true,
            Duration::days(3),
        )),
        store,
        source: Arc::new(source),
        provider: Arc::new(DisabledProvider),
    }
}

// ============ Reconciliation ============

#[tokio::test]
async fn partial_batch_counts_each_set_once() {
    let store = InMemoryStore::new();
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let t1 = t0 + Duration::hours(1);

    Reconciler::new(&store)
        .reconcile_at(
            EntityType::Post,
            vec![
                post("changed-1", "old"),
                post("changed-2", "old"),
                post("same", "same"),
                post("stale", "gone soon"),
            ],
            t0,
        )
        .await
        .unwrap();

    let summary = Reconciler::new(&store)
        .reconcile_at(
            EntityType::Post,
            vec![
                post("new-1", "n"),
                post("new-2", "n"),
                post("new-3", "n"),
                post("changed-1", "new"),
                post("changed-2", "new"),
                post("same", "same"),
            ],
            t1,
        )
        .await
        .unwrap();

    assert_eq!(
        summary,
        Summary {
            created: 3,
            updated: 2,
            deleted: 1,
            skipped: 0
        }
    );
    let same = store.get(EntityType::Post, "same").await.unwrap().unwrap();
    assert_eq!(same.last_synced_at, Some(t1));
    assert!(store.get(EntityType::Post, "stale").await.unwrap().is_none());
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let store = InMemoryStore::new();
    let batch = vec![post("a", "1"), post("b", "2"), post("c", "3")];

    Reconciler::new(&store)
        .reconcile(EntityType::Post, batch.clone())
        .await
        .unwrap();
    let second = Reconciler::new(&store)
        .reconcile(EntityType::Post, batch)
        .await
        .unwrap();
    assert_eq!(second, Summary::default());
}

#[tokio::test]
async fn authored_documents_are_never_deleted() {
    let store = InMemoryStore::new();
    store
        .upsert(EntityType::Post, &post("handwritten", "mine"))
        .await
        .unwrap();

    Reconciler::new(&store)
        .reconcile(EntityType::Post, vec![post("synced", "x")])
        .await
        .unwrap();
    let summary = Reconciler::new(&store)
        .reconcile(EntityType::Post, Vec::new())
        .await
        .unwrap();

    assert_eq!(summary.deleted, 1);
    assert!(store
        .get(EntityType::Post, "handwritten")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn collections_are_reconciled_independently() {
    let store = InMemoryStore::new();
    let about = Document::new("about", "a").with_field("title", "About");
    Reconciler::new(&store)
        .reconcile(EntityType::Page, vec![about])
        .await
        .unwrap();

    let summary = Reconciler::new(&store)
        .reconcile(EntityType::Post, Vec::new())
        .await
        .unwrap();
    assert_eq!(summary.deleted, 0);
    assert!(store.get(EntityType::Page, "about").await.unwrap().is_some());
}

#[tokio::test]
async fn storage_failure_reports_partial_counts() {
    let store = FailingStore::new(2);
    let err = Reconciler::new(&store)
        .reconcile(
            EntityType::Post,
            vec![post("a", "1"), post("b", "2"), post("c", "3"), post("d", "4")],
        )
        .await
        .unwrap_err();

    match err {
        SyncError::Storage { partial, .. } => assert_eq!(partial.created, 2),
        other => panic!("expected storage error, got {}", other),
    }
    // Earlier writes stay applied; a rerun converges.
    assert_eq!(store.inner.list_by_type(EntityType::Post).await.unwrap().len(), 2);
}

// ============ Backfill ============

#[tokio::test]
async fn backfill_terminates_in_bounded_batches() {
    let store = InMemoryStore::new();
    for i in 0..25 {
        store
            .upsert(EntityType::Post, &post(&format!("p{:02}", i), "body"))
            .await
            .unwrap();
    }
    let provider = CountingProvider {
        calls: AtomicUsize::new(0),
    };
    let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default());

    let mut processed = Vec::new();
    loop {
        let report = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        if report.processed == 0 {
            break;
        }
        processed.push(report.processed);
        assert!(processed.len() <= 3, "too many productive batches");
    }

    assert_eq!(processed, vec![10, 10, 5]);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 25);
    assert!(store
        .list_missing_embeddings(EntityType::Post, None, 100)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn drafts_are_not_embedded() {
    let store = InMemoryStore::new();
    store
        .upsert(EntityType::Post, &post("wip", "x").with_field("draft", true))
        .await
        .unwrap();
    store
        .upsert(EntityType::Post, &post("live", "x"))
        .await
        .unwrap();
    let provider = CountingProvider {
        calls: AtomicUsize::new(0),
    };

    let report = Backfiller::new(&store, &provider, &EmbeddingConfig::default())
        .backfill_all(EntityType::Post, 10, None)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    let wip = store.get(EntityType::Post, "wip").await.unwrap().unwrap();
    assert!(wip.embedding.is_none());
}

// ============ Sync sessions ============

#[tokio::test]
async fn second_session_is_rejected_while_first_runs() {
    let store = Arc::new(InMemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let runner = SyncRunner::new(context(
        store.clone(),
        FixedSource::gated(vec![post("a", "1")], gate.clone()),
    ));

    let first = runner.start(Step::Reconcile(EntityType::Post)).unwrap();
    assert!(runner.health().busy);

    match runner.start(Step::Reconcile(EntityType::Page)) {
        Err(RunnerError::AlreadyRunning { run_id, step }) => {
            assert_eq!(run_id, first.run_id);
            assert_eq!(step, "reconcile-posts");
        }
        Ok(_) => panic!("second session must be rejected"),
    }

    gate.add_permits(10);
    let lines = first.collect().await;
    assert!(lines[0].starts_with("run "), "{:?}", lines);
    assert_eq!(
        lines.last().unwrap(),
        "done status=succeeded created=1 updated=0 deleted=0 skipped=0"
    );

    // The slot is free as soon as the terminal line is readable.
    assert!(runner.current().is_none());
    let again = runner.start(Step::Reconcile(EntityType::Post)).unwrap();
    let lines = again.collect().await;
    let (status, summary) = parse_terminal_line(lines.last().unwrap()).unwrap();
    assert_eq!(status, "succeeded");
    assert!(summary.is_noop());
    assert_eq!(runner.last_run().as_deref(), lines.last().map(String::as_str));
}

#[tokio::test]
async fn cancelled_session_ends_with_cancelled_status() {
    let store = Arc::new(InMemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let runner = SyncRunner::new(context(
        store.clone(),
        FixedSource::gated(vec![post("a", "1"), post("b", "2")], gate.clone()),
    ));

    let session = runner.start(Step::SyncAll).unwrap();
    assert!(runner.cancel());
    gate.add_permits(10);

    let lines = session.collect().await;
    assert_eq!(
        lines.last().unwrap(),
        "done status=cancelled created=0 updated=0 deleted=0 skipped=0"
    );
    assert!(store.list_by_type(EntityType::Post).await.unwrap().is_empty());
    assert!(!runner.cancel());
}

#[tokio::test]
async fn storage_failure_ends_with_failed_status() {
    let store = Arc::new(FailingStore::new(1));
    let retention_store = Arc::new(InMemoryStore::new());
    let ctx = PipelineContext {
        config: Arc::new(Config::minimal()),
        store: store.clone(),
        source: Arc::new(FixedSource::new(vec![
            post("a", "1"),
            post("b", "2"),
            post("c", "3"),
        ])),
        provider: Arc::new(DisabledProvider),
        retention: Arc::new(VersionRetention::new(
            retention_store,
            true,
            Duration::days(3),
        )),
    };
    let runner = SyncRunner::new(ctx);

    let lines = runner
        .start(Step::Reconcile(EntityType::Post))
        .unwrap()
        .collect()
        .await;
    let n = lines.len();
    assert!(lines[n - 2].starts_with("error: storage error"), "{:?}", lines);
    assert_eq!(
        lines[n - 1],
        "done status=failed created=1 updated=0 deleted=0 skipped=0"
    );
    assert!(!runner.health().busy);
}

#[tokio::test]
async fn purge_step_reports_deleted_snapshots() {
    let store = Arc::new(InMemoryStore::new());
    let ctx = context(store.clone(), FixedSource::new(Vec::new()));
    let old = Utc::now() - Duration::days(4);
    ctx.retention
        .snapshot_at("page", "about", &Document::new("about", "v1"), old)
        .await;
    ctx.retention
        .snapshot("page", "about", &Document::new("about", "v2"))
        .await;

    let runner = SyncRunner::new(ctx);
    let lines = runner.start(Step::PurgeVersions).unwrap().collect().await;
    assert_eq!(
        lines.last().unwrap(),
        "done status=succeeded created=0 updated=0 deleted=1 skipped=0"
    );
    assert_eq!(store.snapshot_count(), 1);
}

#[tokio::test]
async fn sync_all_counts_documents_not_vectors() {
    let store = Arc::new(InMemoryStore::new());
    let mut ctx = context(
        store.clone(),
        FixedSource::new(vec![post("a", "1"), post("b", "2")]),
    );
    ctx.provider = Arc::new(CountingProvider {
        calls: AtomicUsize::new(0),
    });
    let runner = SyncRunner::new(ctx);

    let lines = runner.start(Step::SyncAll).unwrap().collect().await;
    assert!(
        lines.iter().any(|l| l == "backfill done  embedded 2  failed 0"),
        "{:?}",
        lines
    );
    assert_eq!(
        lines.last().unwrap(),
        "done status=succeeded created=2 updated=0 deleted=0 skipped=0"
    );
    assert!(store
        .list_missing_embeddings(EntityType::Post, None, 100)
        .await
        .unwrap()
        .is_empty());

    let lines = runner
        .start(Step::BackfillEmbeddings)
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        lines.last().unwrap(),
        "done status=succeeded created=0 updated=0 deleted=0 skipped=0"
    );
}
