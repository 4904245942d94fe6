//! Distributed task runtime.
//!
//! A pool of workers pulls and pushes units of work ("futures") through one or
//! more brokers. Every worker runs a single cooperative scheduler: a task body
//! that blocks on a child (`result()`, `wait()`, `map()`) suspends and hands
//! control back to the controller loop, which resumes it once the child's
//! result has been reconciled locally, whether the child ran on this worker or
//! on another machine.
//!
//! Brokers are pure rendezvous points: they match idle workers with
//! unassigned tasks and route replies back to their owners without ever
//! looking inside a task.

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod registry;
pub mod task;
pub mod worker;

pub use config::{BrokerConfig, DispatchPolicy, JobConfig, WorkerConfig};
pub use error::{CodecError, NetError, QueueError, TaskError, WorkerError};
pub use registry::Registry;
pub use task::{FailureKind, GroupId, Outcome, TaskFailure, TaskId, WorkerAddr, WorkerId};
pub use broker::Broker;
pub use worker::{
    AsCompleted, Completion, Context, DoneAndNotDone, Future, ReturnWhen, Worker,
};
