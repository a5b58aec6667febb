use thiserror::Error;

use crate::codec::FrameError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("runnable {0} is already running")]
    AlreadyRunning(String),
    #[error("runnable {0} is already stopped")]
    AlreadyStopped(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("payload of {name} failed: {source}")]
    Payload {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected message {actual}, expected {expected}")]
    UnexpectedMessage { expected: String, actual: String },
    #[error("message {0} has no usable destination")]
    MissingDestination(String),
    #[error("message {0} has no sender name")]
    MissingSender(String),
    #[error("worker {0} doesn't exist")]
    UnknownWorker(String),
    #[error("ui {0} doesn't exist")]
    UnknownUi(String),
    #[error("runnable {0} doesn't exist")]
    UnknownRunnable(String),
    #[error("transport to {target} failed: {message}")]
    Transport { target: String, message: String },
    #[error("peer {target} answered with status {status}")]
    PeerStatus { target: String, status: u16 },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("{0}")]
    Handler(String),
}

impl RelayError {
    pub fn transport(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        RelayError::Transport {
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        RelayError::Handler(message.into())
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
