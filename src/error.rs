//! Error types for fanout.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for dispatch operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A worker's pipe or socket closed before it delivered a reply.
    #[error("worker died before replying")]
    DeadWorker,

    /// The distributed master gave up waiting for remote connect-backs.
    #[error("timed out after {0:?} waiting for remote workers to connect")]
    RemoteWorkerTimeout(Duration),

    /// A task failure transported back from a worker and re-raised here.
    #[error("{kind}: {message}")]
    Task { kind: String, message: String },

    /// A frame that does not fit the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("failed to start remote shell: {0}")]
    RemoteSpawn(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failure raised by a user task.
///
/// `Break` and `Kill` are control signals rather than errors proper: they end
/// the run early and make `map` yield no result. `Fail` is an ordinary
/// failure; it is wrapped, carried back over the wire when the task ran in a
/// worker process, and re-raised from `map` on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    /// Stop handing out new jobs; jobs already in flight finish.
    Break,
    /// Stop handing out new jobs and hard-kill surviving workers.
    Kill,
    /// Ordinary failure, surfaced as [`DispatchError::Task`].
    Fail { kind: String, message: String },
}

impl TaskError {
    /// An ordinary failure with the default kind.
    pub fn failure(message: impl fmt::Display) -> Self {
        Self::Fail {
            kind: "task failure".to_string(),
            message: message.to_string(),
        }
    }

    /// An ordinary failure with an explicit kind, e.g. the name of the
    /// underlying error type.
    pub fn failure_with_kind(kind: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fail {
            kind: kind.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Break => write!(f, "break"),
            Self::Kill => write!(f, "kill"),
            Self::Fail { kind, message } => write!(f, "{kind}: {message}"),
        }
    }
}

/// Result type returned by user tasks.
pub type TaskResult<O> = std::result::Result<O, TaskError>;
