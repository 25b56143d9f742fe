//! Shared error taxonomy for the SSE engine and the job queue.
//!
//! Kinds, not types: every failure mode named by either core maps to exactly
//! one variant here so callers can match on kind regardless of which
//! backend (in-process, Redis pub/sub, Redis streams, memory storage, Redis
//! storage) produced it. Causes are carried as strings (the same choice the
//! Redis-backed bus implementations already make) so the enum stays
//! `Send + Sync + 'static` without boxing trait objects.

use thiserror::Error;

/// Result type used across both cores.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // ---- client/contract ----
    #[error("topic must not be empty")]
    TopicEmpty,

    #[error("event has no event name and no data")]
    MessageEmpty,

    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    #[error("invalid handler for task: {0}")]
    InvalidHandler(String),

    #[error("invalid job payload: {0}")]
    InvalidJobPayload(String),

    #[error("invalid retry count: {0}")]
    InvalidRetryCount(String),

    #[error("unknown job status: {0}")]
    UnknownJobStatus(String),

    // ---- lifecycle ----
    #[error("server is closed")]
    ServerClosed,

    #[error("message bus is closed{}", cause.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    MessageBusClosed { cause: Option<String> },

    #[error("broker is closed")]
    BrokerClosed,

    #[error("client is closed")]
    ClientClosed,

    #[error("response writer does not support flushing")]
    NoFlusher,

    #[error("queue is closed")]
    QueueClosed,

    #[error("queue is already running")]
    QueueAlreadyRunning,

    #[error("queue is not running")]
    QueueNotRunning,

    // ---- not found ----
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("no handler registered for task: {0}")]
    HandlerNotFound(String),

    #[error("client not connected")]
    ClientNotConnected,

    // ---- dependency ----
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("no broker provided")]
    NoBrokerProvided,

    #[error("no redis client configured")]
    NoRedisClient,

    #[error("redis connection failed: {0}")]
    RedisConnectionFailed(String),

    #[error("job handler panicked: {0}")]
    JobPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ServerClosed
                | Error::MessageBusClosed { .. }
                | Error::BrokerClosed
                | Error::ClientClosed
                | Error::QueueClosed
        )
    }
}
