//! Embedding backfill.
//!
//! Finds stored documents that have no vector, embeds them through the
//! configured provider, and persists the results. [`Backfiller::backfill`]
//! does at most one batch of work; [`Backfiller::backfill_all`] walks the
//! pending documents in slug order until none are left past its cursor.
//!
//! Provider failures and timeouts are per document: the document is left
//! without a vector and the rest of the batch continues. Storage failures
//! abort the batch.
//!
//! Vectors are not document changes, so a [`BackfillReport`] never feeds the
//! created/updated/deleted/skipped counters. Its counts are reported on
//! their own progress lines.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{ProviderError, SyncError};
use crate::models::{Document, EntityType, Summary};
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::store::Store;

static NO_PROGRESS: NoProgress = NoProgress;

/// Outcome of one or more backfill batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Vectors computed and stored.
    pub processed: usize,
    /// Documents skipped after a provider error or timeout.
    pub failed: usize,
}

impl BackfillReport {
    pub fn merge(&mut self, other: BackfillReport) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

pub struct Backfiller<'a> {
    store: &'a dyn Store,
    provider: &'a dyn EmbeddingProvider,
    progress: &'a dyn ProgressSink,
    concurrency: usize,
    timeout: Duration,
    max_input_chars: usize,
}

impl<'a> Backfiller<'a> {
    pub fn new(
        store: &'a dyn Store,
        provider: &'a dyn EmbeddingProvider,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            progress: &NO_PROGRESS,
            concurrency: config.concurrency.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Embed up to `batch_size` documents of `entity` that lack a vector.
    pub async fn backfill(
        &self,
        entity: EntityType,
        batch_size: usize,
    ) -> Result<BackfillReport, SyncError> {
        Ok(self.backfill_after(entity, None, batch_size).await?.0)
    }

    /// Sweep every pending document of `entity` once, in slug order,
    /// checking `cancel` between batches.
    ///
    /// The sweep advances past documents that fail, so a run of failures
    /// never hides the documents behind it. Failed documents stay pending
    /// for the next sweep.
    pub async fn backfill_all(
        &self,
        entity: EntityType,
        batch_size: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<BackfillReport, SyncError> {
        let mut total = BackfillReport::default();
        let mut cursor: Option<String> = None;
        loop {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return Err(SyncError::Cancelled {
                    partial: Summary::default(),
                });
            }
            let (report, last) = self
                .backfill_after(entity, cursor.as_deref(), batch_size)
                .await?;
            total.merge(report);
            match last {
                Some(slug) => cursor = Some(slug),
                None => return Ok(total),
            }
        }
    }

    /// One batch starting after `after`. Also returns the last slug the
    /// batch looked at, or `None` when nothing was pending.
    async fn backfill_after(
        &self,
        entity: EntityType,
        after: Option<&str>,
        batch_size: usize,
    ) -> Result<(BackfillReport, Option<String>), SyncError> {
        let mut report = BackfillReport::default();

        let docs = self
            .store
            .list_missing_embeddings(entity, after, batch_size)
            .await
            .map_err(|e| SyncError::storage(Summary::default(), e))?;
        let last = match docs.last() {
            Some(doc) => doc.slug.clone(),
            None => return Ok((report, None)),
        };

        let texts: Vec<String> = docs
            .iter()
            .map(|d| embedding_text(d, self.max_input_chars))
            .collect();
        let results = self.embed_all(&texts).await;

        for (doc, result) in docs.iter().zip(results) {
            match result {
                Ok(vector) => {
                    self.store
                        .set_embedding(entity, &doc.slug, &vector)
                        .await
                        .map_err(|e| SyncError::storage(Summary::default(), e))?;
                    report.processed += 1;
                }
                Err(e) => {
                    tracing::warn!(%entity, slug = %doc.slug, error = %e, "embedding failed; skipping");
                    report.failed += 1;
                    self.progress
                        .report(ProgressEvent::EmbedFailed {
                            entity,
                            slug: doc.slug.clone(),
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }

        tracing::info!(%entity, processed = report.processed, failed = report.failed, "backfill batch finished");
        self.progress
            .report(ProgressEvent::Embedded {
                entity,
                processed: report.processed,
                failed: report.failed,
            })
            .await;

        Ok((report, Some(last)))
    }

    /// One result per text, in input order.
    async fn embed_all(&self, texts: &[String]) -> Vec<Result<Vec<f64>, ProviderError>> {
        if self.provider.supports_batching() && texts.len() > 1 {
            match tokio::time::timeout(self.timeout, self.provider.embed_batch(texts)).await {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => {
                    return vectors.into_iter().map(Ok).collect();
                }
                Ok(Ok(vectors)) => tracing::warn!(
                    expected = texts.len(),
                    got = vectors.len(),
                    "batched embedding returned the wrong count; retrying per document"
                ),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "batched embedding failed; retrying per document")
                }
                Err(_) => tracing::warn!("batched embedding timed out; retrying per document"),
            }
        }

        // Futures are built eagerly (they stay lazy until polled) so the
        // stream is not generic over a closure lifetime, which keeps the
        // spawned session future `Send`.
        let pending: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| async move { (i, self.embed_one(text).await) })
            .collect();
        let mut results: Vec<(usize, Result<Vec<f64>, ProviderError>)> =
            futures::stream::iter(pending)
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        match tokio::time::timeout(self.timeout, self.provider.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.timeout)),
        }
    }
}

/// `title`, a blank line, then the body, cut to `max_chars` characters.
pub fn embedding_text(doc: &Document, max_chars: usize) -> String {
    let full = match doc.title() {
        Some(title) => format!("{}\n\n{}", title, doc.content),
        None => doc.content.clone(),
    };
    match full.char_indices().nth(max_chars) {
        Some((cut, _)) => full[..cut].to_string(),
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LenProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for LenProvider {
        fn model_name(&self) -> &str {
            "len"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("poison") {
                return Err(ProviderError::InvalidResponse("rejected".into()));
            }
            Ok(vec![text.len() as f64])
        }
    }

    #[derive(Clone, Copy)]
    enum BatchMode {
        Ok,
        ShortCount,
        Fail,
    }

    struct BatchProvider {
        mode: BatchMode,
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    impl BatchProvider {
        fn new(mode: BatchMode) -> Self {
            Self {
                mode,
                batch_calls: AtomicUsize::new(0),
                single_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for BatchProvider {
        fn model_name(&self) -> &str {
            "batch"
        }
        fn dims(&self) -> usize {
            1
        }
        fn supports_batching(&self) -> bool {
            true
        }
        async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("poison") {
                return Err(ProviderError::InvalidResponse("rejected".into()));
            }
            Ok(vec![text.len() as f64])
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                BatchMode::Ok => Ok(texts.iter().map(|t| vec![t.len() as f64]).collect()),
                BatchMode::ShortCount => Ok(vec![vec![0.0]]),
                BatchMode::Fail => Err(ProviderError::InvalidResponse("batch rejected".into())),
            }
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f64>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![0.0])
        }
    }

    async fn seed(store: &InMemoryStore, n: usize) {
        for i in 0..n {
            store
                .upsert(
                    EntityType::Post,
                    &Document::new(format!("doc-{:02}", i), "body").with_field("title", "T"),
                )
                .await
                .unwrap();
        }
    }

    #[test]
    fn text_is_title_then_body_truncated_on_char_boundary() {
        let doc = Document::new("a", "héllo wörld").with_field("title", "Tï");
        assert_eq!(embedding_text(&doc, 1000), "Tï\n\nhéllo wörld");
        assert_eq!(embedding_text(&doc, 6), "Tï\n\nhé");
        assert_eq!(embedding_text(&Document::new("b", "x"), 10), "x");
    }

    #[tokio::test]
    async fn provider_failure_skips_only_that_document() {
        let store = InMemoryStore::new();
        seed(&store, 3).await;
        store
            .upsert(
                EntityType::Post,
                &Document::new("doc-poison", "poison").with_field("title", "T"),
            )
            .await
            .unwrap();
        let provider = LenProvider {
            calls: AtomicUsize::new(0),
        };
        let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default());

        let report = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        assert_eq!(report, BackfillReport { processed: 3, failed: 1 });
        let poisoned = store
            .get(EntityType::Post, "doc-poison")
            .await
            .unwrap()
            .unwrap();
        assert!(poisoned.embedding.is_none());

        // Only the failing document is left; the loop terminates.
        let again = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        assert_eq!(again, BackfillReport { processed: 0, failed: 1 });
    }

    #[tokio::test]
    async fn failing_documents_at_the_head_do_not_hide_the_rest() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            store
                .upsert(
                    EntityType::Post,
                    &Document::new(format!("a-{}", i), "poison").with_field("title", "T"),
                )
                .await
                .unwrap();
        }
        for i in 0..5 {
            store
                .upsert(
                    EntityType::Post,
                    &Document::new(format!("b-{}", i), "good").with_field("title", "T"),
                )
                .await
                .unwrap();
        }
        let provider = LenProvider {
            calls: AtomicUsize::new(0),
        };
        let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default());

        let report = backfiller
            .backfill_all(EntityType::Post, 3, None)
            .await
            .unwrap();
        assert_eq!(report, BackfillReport { processed: 5, failed: 3 });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 8);

        let pending = store
            .list_missing_embeddings(EntityType::Post, None, 100)
            .await
            .unwrap();
        let slugs: Vec<_> = pending.iter().map(|d| d.slug.as_str()).collect();
        assert_eq!(slugs, vec!["a-0", "a-1", "a-2"]);
    }

    #[tokio::test]
    async fn batching_provider_gets_one_call_per_batch() {
        let store = InMemoryStore::new();
        seed(&store, 4).await;
        let provider = BatchProvider::new(BatchMode::Ok);
        let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default());

        let report = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        assert_eq!(report, BackfillReport { processed: 4, failed: 0 });
        assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 0);
        let doc = store.get(EntityType::Post, "doc-00").await.unwrap().unwrap();
        assert_eq!(doc.embedding, Some(vec![7.0]));
    }

    #[tokio::test]
    async fn wrong_batch_count_falls_back_to_single_calls() {
        let store = InMemoryStore::new();
        seed(&store, 3).await;
        let provider = BatchProvider::new(BatchMode::ShortCount);
        let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default());

        let report = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        assert_eq!(report, BackfillReport { processed: 3, failed: 0 });
        assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 3);
        let doc = store.get(EntityType::Post, "doc-02").await.unwrap().unwrap();
        assert_eq!(doc.embedding, Some(vec![7.0]));
    }

    #[tokio::test]
    async fn batch_error_isolates_the_failing_document() {
        let store = InMemoryStore::new();
        seed(&store, 2).await;
        store
            .upsert(
                EntityType::Post,
                &Document::new("doc-poison", "poison").with_field("title", "T"),
            )
            .await
            .unwrap();
        let provider = BatchProvider::new(BatchMode::Fail);
        let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default());

        let report = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        assert_eq!(report, BackfillReport { processed: 2, failed: 1 });
        assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 3);
        assert!(store
            .get(EntityType::Post, "doc-poison")
            .await
            .unwrap()
            .unwrap()
            .embedding
            .is_none());
    }

    #[tokio::test]
    async fn timed_out_call_counts_as_failure() {
        let store = InMemoryStore::new();
        seed(&store, 2).await;
        let provider = SlowProvider;
        let backfiller = Backfiller::new(&store, &provider, &EmbeddingConfig::default())
            .with_timeout(Duration::from_millis(20));

        let report = backfiller.backfill(EntityType::Post, 10).await.unwrap();
        assert_eq!(report, BackfillReport { processed: 0, failed: 2 });
    }

    #[tokio::test]
    async fn backfill_all_stops_when_cancelled() {
        let store = InMemoryStore::new();
        seed(&store, 5).await;
        let provider = LenProvider {
            calls: AtomicUsize::new(0),
        };
        let token = CancellationToken::new();
        token.cancel();
        let err = Backfiller::new(&store, &provider, &EmbeddingConfig::default())
            .backfill_all(EntityType::Post, 2, Some(&token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
