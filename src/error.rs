//! Error types for the scan engine.
//!
//! Each subsystem gets its own error enum; checks isolate their failures
//! behind `CheckError` so a failing check becomes a failed job, never a
//! failed scan.

use thiserror::Error;
use uuid::Uuid;

/// Configuration problems surfaced to the operator before anything starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scan options: {reason}")]
    InvalidOptions { reason: String },

    #[error("missing environment variable {name}")]
    MissingEnv { name: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Errors from the scan store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("job {job_id} is not claimed by worker {worker_id}")]
    NotClaimOwner { job_id: Uuid, worker_id: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("illegal {entity} transition from {from} to {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Errors from the request executor. Timeouts are not modelled here: the
/// executor reports them as a classified outcome, not as an error kind.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("request construction failed: {reason}")]
    Request { reason: String },

    #[error("request timed out after {0:?}")]
    DeadlineElapsed(std::time::Duration),
}

/// Errors from the browser pool and browser instances.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser pool is shut down")]
    PoolClosed,

    #[error("browser launch failed: {reason}")]
    Launch { reason: String },

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
}

/// Errors from the out-of-band interactions subsystem.
#[derive(Debug, Error)]
pub enum OobError {
    #[error("no out-of-band session is registered")]
    NotRegistered,

    #[error("the server evicted our correlation prefix")]
    Evicted,

    #[error("poll failed: {reason}")]
    Poll { reason: String },

    #[error("session file error: {0}")]
    Session(#[from] std::io::Error),

    #[error("interaction payload decryption failed")]
    Decrypt,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of a whole scan run, surfaced to the operator.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Oob(#[from] OobError),
}

/// Errors a check may return. The worker converts these into a failed job
/// (or a requeue, when the failure was a cancellation).
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("check was cancelled")]
    Cancelled,

    #[error("no check registered for job kind {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Oob(#[from] OobError),

    #[error("{0}")]
    Other(String),
}
