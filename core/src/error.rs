use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, RoundtableErr>;

#[derive(Error, Debug)]
pub enum RoundtableErr {
    /// The lock file could not be acquired before the deadline. Retryable:
    /// the caller is expected to try again on its next poll.
    #[error("could not acquire {path} within {deadline:?}")]
    LockTimeout { path: PathBuf, deadline: Duration },

    /// `create` found an existing log for the generated id.
    #[error("discussion {0} already exists")]
    DiscussionExists(String),

    /// The log exists but does not begin with a valid `start` record.
    #[error("discussion {0} has no start record")]
    MissingStart(String),

    /// Returned by the invoker when the child process outlived its timeout
    /// and had to be terminated. Routes to retry-with-backoff.
    #[error("timeout waiting for child process to exit")]
    Timeout,

    /// The child exited nonzero, or exited zero without producing output.
    #[error("{0}")]
    Invocation(String),

    /// The agent binary could not be located at startup.
    #[error("agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl RoundtableErr {
    /// Whether this failure should go through the timeout retry path
    /// rather than producing an immediate `error` record.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RoundtableErr::Timeout)
    }
}

/// Flow-control outcomes of turn admission. These are expected in normal
/// operation, logged at debug level, and never surfaced in the log or to
/// the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Another task already holds this discussion's responding lock.
    AlreadyResponding,
    /// This round was already attempted during this process lifetime.
    AlreadyAttempted,
    /// All concurrency slots are busy; the candidate is (or already was)
    /// queued.
    Queued,
    /// The per-discussion circuit breaker is open.
    CircuitOpen,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Rejection::AlreadyResponding => "ALREADY_RESPONDING",
            Rejection::AlreadyAttempted => "ALREADY_ATTEMPTED",
            Rejection::Queued => "QUEUED",
            Rejection::CircuitOpen => "LOCAL_CIRCUIT_OPEN",
        };
        f.write_str(s)
    }
}
