//! Identity and wire-level shape of a task.
//!
//! The scheduler-side record of a task (callable, children, callbacks,
//! continuation state) lives in `worker::table`; everything here is what two
//! workers have to agree on when a task crosses the network.

use std::{fmt, str::FromStr};

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{CodecError, TaskError};

/// Opaque identity of a worker process. Drawn at random when the worker
/// starts, so two workers never need to coordinate to get distinct ids.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub struct WorkerId(pub u64);

impl WorkerId {
    /// Owner of the distinguished root id.
    pub const NONE: WorkerId = WorkerId(u64::MAX);

    pub fn random() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != Self::NONE.0 {
                return WorkerId(id);
            }
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// `(owner, sequence)`: globally unique, immutable once assigned.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub struct TaskId {
    pub worker: WorkerId,
    pub seq: u64,
}

impl TaskId {
    /// Parent of every root task: "no parent / origin root".
    pub const ROOT: TaskId = TaskId {
        worker: WorkerId::NONE,
        seq: 0,
    };

    pub const WIRE_LEN: usize = 16;

    pub fn new(worker: WorkerId, seq: u64) -> Self {
        Self { worker, seq }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// Fixed 16 byte form used in frame headers, where the broker needs the id
    /// without decoding the task payload.
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        LittleEndian::write_u64(&mut buf[0..8], self.worker.0);
        LittleEndian::write_u64(&mut buf[8..16], self.seq);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            worker: WorkerId(u64::from_le_bytes(*array_ref![buf, 0, 8])),
            seq: u64::from_le_bytes(*array_ref![buf, 8, 8]),
        })
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}:{}", self.worker, self.seq)
        }
    }
}

impl FromStr for TaskId {
    type Err = CodecError;

    /// Reads the [`Display`](fmt::Display) form back.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text == "root" {
            return Ok(Self::ROOT);
        }
        let (worker, seq) = text.split_once(':').ok_or(CodecError::Decode("task id"))?;
        let worker = u64::from_str_radix(worker, 16).map_err(|_| CodecError::Decode("task id"))?;
        let seq = seq.parse().map_err(|_| CodecError::Decode("task id"))?;
        Ok(Self::new(WorkerId(worker), seq))
    }
}

/// Routable address of a worker or broker (`host:port` of its QUIC endpoint).
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub struct WorkerAddr(pub String);

impl WorkerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerAddr {
    fn from(addr: &str) -> Self {
        Self(addr.to_owned())
    }
}

impl From<String> for WorkerAddr {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

/// Key for "universal" completion callbacks, used by reduction-style
/// operations that every observing worker takes part in.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub struct GroupId(pub u64);

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum FailureKind {
    Raised,
    Panicked,
    Cancelled,
    Timeout,
    Serialization,
    UnknownFunction,
    TaskNotFound,
    InvalidState,
    Shutdown,
}

/// A task failure as it travels between workers. Converting back into a
/// [`TaskError`] preserves the kind, so the owner re-raises what the executor
/// raised rather than a generic error.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&TaskError> for TaskFailure {
    fn from(error: &TaskError) -> Self {
        match error {
            TaskError::Raised(msg) => Self::new(FailureKind::Raised, msg.clone()),
            TaskError::Panicked(msg) => Self::new(FailureKind::Panicked, msg.clone()),
            TaskError::Cancelled => Self::new(FailureKind::Cancelled, ""),
            TaskError::Timeout => Self::new(FailureKind::Timeout, ""),
            TaskError::Serialization(msg) => Self::new(FailureKind::Serialization, msg.clone()),
            TaskError::UnknownFunction(name) => {
                Self::new(FailureKind::UnknownFunction, name.clone())
            }
            TaskError::TaskNotFound(id) => Self::new(FailureKind::TaskNotFound, id.to_string()),
            TaskError::InvalidState(msg) => Self::new(FailureKind::InvalidState, msg.clone()),
            TaskError::Shutdown => Self::new(FailureKind::Shutdown, ""),
        }
    }
}

impl From<TaskError> for TaskFailure {
    fn from(error: TaskError) -> Self {
        Self::from(&error)
    }
}

impl From<TaskFailure> for TaskError {
    fn from(failure: TaskFailure) -> Self {
        match failure.kind {
            FailureKind::Raised => TaskError::Raised(failure.message),
            FailureKind::Panicked => TaskError::Panicked(failure.message),
            FailureKind::Cancelled => TaskError::Cancelled,
            FailureKind::Timeout => TaskError::Timeout,
            FailureKind::Serialization => TaskError::Serialization(failure.message),
            FailureKind::UnknownFunction => TaskError::UnknownFunction(failure.message),
            FailureKind::TaskNotFound => match failure.message.parse() {
                Ok(id) => TaskError::TaskNotFound(id),
                Err(_) => TaskError::InvalidState(failure.message),
            },
            FailureKind::InvalidState => TaskError::InvalidState(failure.message),
            FailureKind::Shutdown => TaskError::Shutdown,
        }
    }
}

/// The single outcome of a finished task. Values are kept encoded until the
/// consumer decodes them into its expected type.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Outcome {
    Value(Vec<u8>),
    Failure(TaskFailure),
}

impl Outcome {
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure(), Some(f) if f.kind == FailureKind::Cancelled)
    }
}

/// Everything a worker needs to execute someone else's task, or to reconcile
/// the result of its own task executed elsewhere.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub parent: TaskId,
    /// Address of the owning worker, destination of the REPLY.
    pub owner: WorkerAddr,
    /// Registered name of the callable.
    pub function: String,
    pub args: Vec<u8>,
    pub groups: Vec<GroupId>,
    /// Creation time in microseconds since the epoch.
    pub created_at: i64,
    pub outcome: Option<Outcome>,
    pub executor: Option<WorkerId>,
    pub execution_micros: Option<u64>,
}

impl TaskEnvelope {
    pub fn created_at(&self) -> DateTime<Utc> {
        match NaiveDateTime::from_timestamp_micros(self.created_at) {
            Some(naive) => Utc.from_utc_datetime(&naive),
            None => Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_wire_form() {
        let id = TaskId::new(WorkerId(0xdead_beef), 42);
        let wire = id.to_wire();
        assert_eq!(TaskId::from_wire(&wire), Some(id));
        assert_eq!(TaskId::from_wire(&wire[..15]), None);
    }

    #[test]
    fn random_worker_ids_avoid_root_owner() {
        for _ in 0..64 {
            assert_ne!(WorkerId::random(), WorkerId::NONE);
        }
    }

    #[test]
    fn failure_kind_survives_conversion() {
        let raised = TaskError::Raised("boom".into());
        let failure = TaskFailure::from(&raised);
        assert_eq!(failure.kind, FailureKind::Raised);
        assert_eq!(TaskError::from(failure), raised);

        let cancelled = TaskFailure::from(TaskError::Cancelled);
        assert_eq!(TaskError::from(cancelled), TaskError::Cancelled);

        let missing = TaskError::TaskNotFound(TaskId::new(WorkerId(0xab), 9));
        assert_eq!(TaskError::from(TaskFailure::from(&missing)), missing);
    }

    #[test]
    fn task_ids_parse_their_display_form() {
        let ids = [
            TaskId::ROOT,
            TaskId::new(WorkerId(1), 7),
            TaskId::new(WorkerId(u64::MAX - 1), 0),
        ];
        for id in ids {
            assert_eq!(id.to_string().parse::<TaskId>(), Ok(id));
        }
        assert!("7".parse::<TaskId>().is_err());
        assert!("zz:1".parse::<TaskId>().is_err());
    }

    #[test]
    fn root_displays_as_root() {
        assert_eq!(TaskId::ROOT.to_string(), "root");
        assert_eq!(
            TaskId::new(WorkerId(1), 7).to_string(),
            "0000000000000001:7"
        );
    }
}
