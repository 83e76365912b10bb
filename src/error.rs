//! Typed errors for the places where callers need to branch.
//!
//! Adapters and the CLI use `anyhow::Result`; these enums sit at the
//! boundaries where the kind of failure changes what happens next: a
//! storage failure ends a run as `failed` with partial counters, a provider
//! failure is absorbed per document, and a busy runner is reported without
//! queueing.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::Summary;

/// Failure of a reconcile, backfill, or pipeline step.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A store read or write failed. The remaining work was not applied.
    #[error("storage error after {partial}: {cause:#}")]
    Storage {
        partial: Summary,
        cause: anyhow::Error,
    },

    /// The run was cancelled between two units of work.
    #[error("cancelled after {partial}")]
    Cancelled { partial: Summary },

    /// The incoming batch could not be loaded at all.
    #[error("source error: {0:#}")]
    Source(anyhow::Error),
}

impl SyncError {
    pub fn storage(partial: Summary, cause: impl Into<anyhow::Error>) -> Self {
        SyncError::Storage {
            partial,
            cause: cause.into(),
        }
    }

    /// Counters accumulated before the failure.
    pub fn partial(&self) -> Summary {
        match self {
            SyncError::Storage { partial, .. } | SyncError::Cancelled { partial } => *partial,
            SyncError::Source(_) => Summary::default(),
        }
    }

    /// Returns a copy of this error with `earlier` added to the partial counters.
    pub fn with_prior(self, earlier: Summary) -> Self {
        match self {
            SyncError::Storage { mut partial, cause } => {
                partial.merge(earlier);
                SyncError::Storage { partial, cause }
            }
            SyncError::Cancelled { mut partial } => {
                partial.merge(earlier);
                SyncError::Cancelled { partial }
            }
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled { .. })
    }
}

/// Failure of a single embedding call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("embedding transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Config(String),
}

/// Failure to start a sync session.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("a sync run is already running (run {run_id}, step {step})")]
    AlreadyRunning { run_id: Uuid, step: String },
}

/// Failure on the direct editing path.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("{entity} '{slug}' not found")]
    NotFound { entity: String, slug: String },

    #[error("version snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("{entity} '{slug}' already exists")]
    AlreadyExists { entity: String, slug: String },

    #[error("invalid document: {0}")]
    Invalid(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
