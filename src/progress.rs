//! Sync and backfill progress reporting.
//!
//! Pipeline components emit [`ProgressEvent`]s to a [`ProgressSink`]. Each
//! event renders as one line of text. The runner forwards lines over a
//! bounded channel to the session reader; the CLI writes them to stderr so
//! stdout stays parseable for scripts.

use std::fmt;
use std::io::Write;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{EntityType, Summary};

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Incoming and stored collections were loaded for an entity type.
    Loaded {
        entity: EntityType,
        incoming: usize,
        existing: usize,
    },
    Created { entity: EntityType, slug: String },
    Updated { entity: EntityType, slug: String },
    Deleted { entity: EntityType, slug: String },
    Skipped {
        entity: EntityType,
        slug: String,
        reason: String,
    },
    /// A backfill batch finished.
    Embedded {
        entity: EntityType,
        processed: usize,
        failed: usize,
    },
    EmbedFailed {
        entity: EntityType,
        slug: String,
        error: String,
    },
    /// A reconcile pass for one entity type finished.
    Reconciled { entity: EntityType, summary: Summary },
    Message(String),
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Loaded {
                entity,
                incoming,
                existing,
            } => write!(
                f,
                "reconcile {}  incoming {} / stored {}",
                entity,
                format_number(*incoming as u64),
                format_number(*existing as u64)
            ),
            ProgressEvent::Created { entity, slug } => write!(f, "  + {} {}", entity, slug),
            ProgressEvent::Updated { entity, slug } => write!(f, "  ~ {} {}", entity, slug),
            ProgressEvent::Deleted { entity, slug } => write!(f, "  - {} {}", entity, slug),
            ProgressEvent::Skipped {
                entity,
                slug,
                reason,
            } => write!(f, "  ! {} {} skipped: {}", entity, slug, reason),
            ProgressEvent::Embedded {
                entity,
                processed,
                failed,
            } => write!(
                f,
                "backfill {}  embedded {}  failed {}",
                entity,
                format_number(*processed as u64),
                format_number(*failed as u64)
            ),
            ProgressEvent::EmbedFailed {
                entity,
                slug,
                error,
            } => write!(f, "  ! {} {} embedding failed: {}", entity, slug, error),
            ProgressEvent::Reconciled { entity, summary } => {
                write!(f, "reconcile {}  {}", entity, summary)
            }
            ProgressEvent::Message(msg) => f.write_str(msg),
        }
    }
}

/// Receives progress events. Implementations may wait (backpressure).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, event: ProgressEvent);
}

/// Forwards rendered lines into a bounded channel. A full channel makes the
/// producer wait; a closed channel drops the line.
pub struct ChannelProgress {
    tx: mpsc::Sender<String>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ProgressSink for ChannelProgress {
    async fn report(&self, event: ProgressEvent) {
        if self.tx.send(event.to_string()).await.is_err() {
            tracing::debug!("session reader gone; dropping progress line");
        }
    }
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

#[async_trait]
impl ProgressSink for StderrProgress {
    async fn report(&self, event: ProgressEvent) {
        let _ = writeln!(std::io::stderr().lock(), "{}", event);
    }
}

/// No-op sink for callers that do not observe progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn events_render_one_line() {
        let line = ProgressEvent::Loaded {
            entity: EntityType::Post,
            incoming: 1200,
            existing: 3,
        }
        .to_string();
        assert_eq!(line, "reconcile post  incoming 1,200 / stored 3");
        assert_eq!(
            ProgressEvent::Deleted {
                entity: EntityType::Page,
                slug: "old".into()
            }
            .to_string(),
            "  - page old"
        );
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_tolerates_closed_reader() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ChannelProgress::new(tx);
        sink.report(ProgressEvent::Message("hello".into())).await;
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        drop(rx);
        sink.report(ProgressEvent::Message("lost".into())).await;
    }
}
