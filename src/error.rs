use std::io;

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};
use thiserror::Error;

use crate::task::TaskId;

/// A payload could not be encoded or decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("could not encode {0}")]
    Encode(String),

    #[error("could not decode a {0} from the received bytes")]
    Decode(&'static str),

    #[error("malformed frame: {0}")]
    Frame(&'static str),

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("compression failed: {0}")]
    Compression(String),
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Read(#[from] ReadExactError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("could not generate a certificate: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("broker {0} is unreachable")]
    BrokerUnreachable(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    #[error("link closed")]
    Closed,

    #[error("no async runtime found")]
    NoRuntime,
}

/// Violations of the TaskQueue protocol, plus the ways a queue stops.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} is not registered on this worker")]
    TaskNotFound(TaskId),

    #[error("task {id}: {reason}")]
    InvalidTaskState { id: TaskId, reason: &'static str },

    #[error("shutdown received from the broker")]
    Shutdown,

    #[error("queue is empty and nothing can refill it")]
    Starved,

    #[error("lost the link to broker {0}")]
    BrokerLost(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Net(#[from] NetError),
}

/// How a task failed, as seen by whoever awaits its result. The same kinds are
/// carried across the wire, so a parent re-raises exactly what its child
/// raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Raised(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out waiting for a task")]
    Timeout,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("no function registered as `{0}`")]
    UnknownFunction(String),

    #[error("task {0} is not registered on this worker")]
    TaskNotFound(TaskId),

    #[error("invalid task state: {0}")]
    InvalidState(String),

    #[error("worker is shutting down")]
    Shutdown,
}

impl TaskError {
    /// The usual way for a task body to fail.
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised(message.into())
    }
}

impl From<CodecError> for TaskError {
    fn from(error: CodecError) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<QueueError> for TaskError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::TaskNotFound(id) => Self::TaskNotFound(id),
            QueueError::Shutdown => Self::Shutdown,
            QueueError::Codec(e) => Self::Serialization(e.to_string()),
            other => Self::InvalidState(other.to_string()),
        }
    }
}

/// Failures of the worker process itself, as opposed to failures of the
/// tasks it runs.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("root task failed: {0}")]
    Root(TaskError),

    #[error("continuation of task {0} is gone")]
    ContinuationLost(TaskId),

    #[error("could not spawn a runner thread: {0}")]
    Spawn(io::Error),

    #[error("no INIT reply from broker {0}")]
    InitTimeout(String),

    #[error("shutdown received before the root task finished")]
    UnexpectedShutdown,
}
