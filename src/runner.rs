//! Sync session runner.
//!
//! Runs one [`Step`] at a time on a background task and streams its
//! progress as text lines over a bounded channel. A session goes
//! `running → succeeded | failed | cancelled`; once its stream closes it is
//! gone, apart from the last terminal line kept in memory.
//!
//! The stream always ends with a terminal line:
//!
//! ```text
//! done status=failed created=3 updated=0 deleted=0 skipped=1
//! ```
//!
//! A failed run sends an `error: ...` line just before it.
//!
//! The counters describe documents only: rows created, updated or deleted
//! by reconciliation (snapshots for `purge-versions`) and source files
//! skipped. Embedding backfill leaves them untouched and reports its own
//! `backfill ... embedded N failed N` lines instead.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RunnerError, SyncError};
use crate::models::Summary;
use crate::pipeline::{run_step, PipelineContext, Step};
use crate::progress::{ChannelProgress, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// A sync run as seen from outside.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub step: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
}

/// Liveness report, independent of whether a run is active.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerHealth {
    pub alive: bool,
    pub busy: bool,
}

/// The reading end of a started session.
pub struct SessionStream {
    pub run_id: Uuid,
    pub step: Step,
    rx: mpsc::Receiver<String>,
}

impl SessionStream {
    /// Next line, or `None` once the terminal line has been read.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain every remaining line.
    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.rx.recv().await {
            lines.push(line);
        }
        lines
    }

    pub fn into_stream(self) -> ReceiverStream<String> {
        ReceiverStream::new(self.rx)
    }
}

/// Parses a terminal line back into its status and counters.
pub fn parse_terminal_line(line: &str) -> Option<(String, Summary)> {
    let rest = line.strip_prefix("done ")?;
    let mut status = None;
    let mut summary = Summary::default();
    for pair in rest.split_whitespace() {
        let (key, value) = pair.split_once('=')?;
        match key {
            "status" => status = Some(value.to_string()),
            "created" => summary.created = value.parse().ok()?,
            "updated" => summary.updated = value.parse().ok()?,
            "deleted" => summary.deleted = value.parse().ok()?,
            "skipped" => summary.skipped = value.parse().ok()?,
            _ => {}
        }
    }
    Some((status?, summary))
}

fn terminal_line(status: RunStatus, summary: &Summary) -> String {
    format!("done status={} {}", status.as_str(), summary)
}

struct ActiveSession {
    run: SyncRun,
    cancel: CancellationToken,
}

struct Inner {
    ctx: PipelineContext,
    active: Mutex<Option<ActiveSession>>,
    last_run: Mutex<Option<String>>,
}

/// Locks `mutex`, recovering it if poisoned. Both runner mutexes hold plain
/// values that stay valid after a panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the active slot when the session task ends, including by panic.
struct SlotGuard {
    inner: Arc<Inner>,
    run_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.inner.active);
        if active.as_ref().map(|a| a.run.run_id) == Some(self.run_id) {
            *active = None;
        }
    }
}

/// Single-flight executor for pipeline steps. Clones share the same slot.
#[derive(Clone)]
pub struct SyncRunner {
    inner: Arc<Inner>,
}

impl SyncRunner {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                active: Mutex::new(None),
                last_run: Mutex::new(None),
            }),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.ctx
    }

    /// Claim the runner and start `step` on a background task.
    ///
    /// Fails immediately with [`RunnerError::AlreadyRunning`] if another
    /// session holds the runner. Must be called within a tokio runtime.
    pub fn start(&self, step: Step) -> Result<SessionStream, RunnerError> {
        let cancel = CancellationToken::new();
        let run = SyncRun {
            run_id: Uuid::new_v4(),
            step: step.name().to_string(),
            started_at: Utc::now(),
            status: RunStatus::Running,
        };

        {
            let mut active = lock(&self.inner.active);
            if let Some(current) = active.as_ref() {
                return Err(RunnerError::AlreadyRunning {
                    run_id: current.run.run_id,
                    step: current.run.step.clone(),
                });
            }
            *active = Some(ActiveSession {
                run: run.clone(),
                cancel: cancel.clone(),
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.ctx.config.runner.stream_buffer);
        let run_id = run.run_id;
        let guard = SlotGuard {
            inner: self.inner.clone(),
            run_id,
        };
        tokio::spawn(execute(self.inner.clone(), guard, step, run_id, cancel, tx));

        Ok(SessionStream { run_id, step, rx })
    }

    /// Request cancellation of the active session. Returns `false` when idle.
    pub fn cancel(&self) -> bool {
        let active = lock(&self.inner.active);
        match active.as_ref() {
            Some(session) => {
                tracing::info!(run_id = %session.run.run_id, "cancellation requested");
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<SyncRun> {
        lock(&self.inner.active)
            .as_ref()
            .map(|a| a.run.clone())
    }

    /// Terminal line of the most recently finished run.
    pub fn last_run(&self) -> Option<String> {
        lock(&self.inner.last_run).clone()
    }

    pub fn health(&self) -> RunnerHealth {
        RunnerHealth {
            alive: true,
            busy: lock(&self.inner.active).is_some(),
        }
    }
}

async fn execute(
    inner: Arc<Inner>,
    guard: SlotGuard,
    step: Step,
    run_id: Uuid,
    cancel: CancellationToken,
    tx: mpsc::Sender<String>,
) {
    let progress = ChannelProgress::new(tx.clone());
    tracing::info!(%run_id, %step, "sync run started");
    progress
        .report(ProgressEvent::Message(format!(
            "run {} started step={}",
            run_id, step
        )))
        .await;

    let outcome = AssertUnwindSafe(run_step(&inner.ctx, step, &progress, &cancel))
        .catch_unwind()
        .await;

    let (status, summary, error) = match outcome {
        Ok(Ok(summary)) => (RunStatus::Succeeded, summary, None),
        Ok(Err(e @ SyncError::Cancelled { .. })) => (RunStatus::Cancelled, e.partial(), None),
        Ok(Err(e)) => (RunStatus::Failed, e.partial(), Some(e.to_string())),
        Err(_) => (
            RunStatus::Failed,
            Summary::default(),
            Some("step panicked".to_string()),
        ),
    };

    let terminal = terminal_line(status, &summary);
    match status {
        RunStatus::Failed => {
            tracing::error!(%run_id, %step, %summary, error = ?error, "sync run failed")
        }
        _ => tracing::info!(%run_id, %step, status = status.as_str(), %summary, "sync run finished"),
    }

    if let Some(error) = error {
        let _ = tx.send(format!("error: {}", error)).await;
    }
    *lock(&inner.last_run) = Some(terminal.clone());

    // Free the slot before the terminal line, so a caller that reads it can
    // start the next run straight away.
    drop(guard);
    let _ = tx.send(terminal).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_line_roundtrip() {
        let summary = Summary {
            created: 3,
            updated: 2,
            deleted: 1,
            skipped: 0,
        };
        let line = terminal_line(RunStatus::Succeeded, &summary);
        assert_eq!(
            line,
            "done status=succeeded created=3 updated=2 deleted=1 skipped=0"
        );
        let (status, parsed) = parse_terminal_line(&line).unwrap();
        assert_eq!(status, "succeeded");
        assert_eq!(parsed, summary);
        assert!(parse_terminal_line("+ post hello").is_none());
    }

    fn runner() -> SyncRunner {
        let store = Arc::new(crate::store::memory::InMemoryStore::new());
        SyncRunner::new(PipelineContext {
            config: Arc::new(crate::config::Config::minimal()),
            retention: Arc::new(crate::versions::VersionRetention::new(
                store.clone(),
                true,
                chrono::Duration::days(3),
            )),
            source: Arc::new(crate::source::MarkdownDirSource::new(
                crate::config::Config::minimal().content,
            )),
            provider: Arc::new(crate::embedding::DisabledProvider),
            store,
        })
    }

    #[tokio::test]
    async fn poisoned_locks_do_not_wedge_the_runner() {
        let runner = runner();
        let inner = runner.inner.clone();
        let _ = std::thread::spawn(move || {
            let _active = inner.active.lock().unwrap();
            let _last = inner.last_run.lock().unwrap();
            panic!("poison both locks");
        })
        .join();
        assert!(runner.inner.active.is_poisoned());

        assert!(!runner.health().busy);
        assert!(runner.current().is_none());
        assert!(!runner.cancel());

        let lines = runner.start(Step::PurgeVersions).unwrap().collect().await;
        assert_eq!(
            lines.last().unwrap(),
            "done status=succeeded created=0 updated=0 deleted=0 skipped=0"
        );
        assert_eq!(runner.last_run().as_deref(), lines.last().map(String::as_str));
        assert!(!runner.health().busy);
    }
}
