//! Actor Layer Error Types

use network::NetworkError;
use thiserror::Error;
use types::FiberId;

#[derive(Error, Debug)]
pub enum LockError {
    /// The optional wait budget elapsed before the lock was granted; the
    /// waiter has been removed from the queue.
    #[error("coroutine lock wait timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The lock service was dropped while waiting.
    #[error("coroutine lock service shut down")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SendError {
    /// No live fiber with that id in this process.
    #[error("no fiber {fiber} in this process")]
    UnknownFiber { fiber: FiberId },

    /// The target fiber is shutting down; its inbox is closed.
    #[error("fiber {fiber} stopped")]
    FiberStopped { fiber: FiberId },

    /// Remote delivery failed at the transport layer.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}
