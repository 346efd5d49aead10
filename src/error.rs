use std::time::Duration;

use thiserror::Error;

/// Failure conditions shared by the distributed primitives and the build lifecycle.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The shared backing store could not be reached. The caller must treat the
    /// outcome of the attempted operation as unknown.
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Timed out after {waited:?} waiting for lock on {map}/{key}")]
    LockTimeout {
        map: String,
        key: String,
        waited: Duration,
    },

    #[error("Build job {job_id} exceeded {attempts} requeue attempts")]
    PoisonJob { job_id: String, attempts: u32 },

    #[error("Build job {job_id} held by {agent} has not been refreshed for {stale_for:?}")]
    OrphanedJob {
        job_id: String,
        agent: String,
        stale_for: Duration,
    },

    #[error("Terminal record for build {job_id} could not be reported: {reason}")]
    ReportFailed { job_id: String, reason: String },

    #[error("Invalid build status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Transient conditions are retried with backoff at the originating call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinatorError::StoreUnavailable(_) | CoordinatorError::LockTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
