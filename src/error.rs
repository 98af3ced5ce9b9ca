use thiserror::Error;

/// Failures surfaced by the download queue to its callers.
///
/// Eviction I/O problems are deliberately absent: the cache store logs
/// and skips them so eviction keeps making progress, and lookup I/O
/// errors degrade to a cache miss instead of failing the job.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("download queue is full")]
    QueueFull,

    #[error("download queue has shut down")]
    QueueClosed,

    #[error("job not found")]
    JobNotFound,

    #[error("job already reached a terminal state")]
    AlreadyTerminal,

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("fetch timed out after {0}s")]
    FetchTimeout(u64),
}
