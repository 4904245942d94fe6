//! The worker: task table, queue, cooperative scheduler and the futures API
//! task bodies program against.
//!
//! Every task body runs on its own parked OS thread, but only one of them (or
//! the controller loop) holds the baton at any time. Task state therefore
//! sits behind a single mutex that is never contended in practice, and is
//! never held across a switch.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use hashbrown::HashMap;
use tracing::{debug, error, warn};

mod context;
mod future;
mod queue;
mod scheduler;
pub(crate) mod table;

pub use context::{AsCompleted, Context, DoneAndNotDone, ReturnWhen};
pub use future::{Completion, Future};

use self::{
    queue::TaskQueue,
    scheduler::Controller,
    table::{Callable, LocalFn, PendingCallback, TaskTable},
};
use crate::{
    config::WorkerConfig,
    error::{NetError, TaskError, WorkerError},
    net::{
        wire::{Envelope, WorkerInfo},
        Inbound, Message, Transport,
    },
    registry::Registry,
    task::{GroupId, Outcome, TaskId, WorkerAddr, WorkerId},
};

pub(crate) type GroupCallback = Arc<dyn Fn(&Completion) + Send + Sync>;

/// What a parked continuation is woken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    /// Run the task body from the top.
    Start,
    /// A child the task waits on is ready.
    Child(TaskId),
    /// The deadline the task parked with passed.
    Timeout,
    /// The worker is going away.
    Shutdown,
}

pub(crate) struct WorkerState {
    pub(crate) table: TaskTable,
    pub(crate) queue: TaskQueue,
    /// Tasks suspended in a blocking call, with their deadline if any.
    parked: HashMap<TaskId, Option<Instant>>,
    timers: BinaryHeap<Reverse<(Instant, TaskId)>>,
    /// Set while suspended tasks are being unwound at exit.
    pub(crate) draining: bool,
}

impl WorkerState {
    pub(crate) fn park(&mut self, task: TaskId, deadline: Option<Instant>) {
        self.parked.insert(task, deadline);
        if let Some(deadline) = deadline {
            self.timers.push(Reverse((deadline, task)));
        }
    }

    pub(crate) fn unpark(&mut self, task: &TaskId) {
        self.parked.remove(task);
    }

    pub(crate) fn is_parked(&self, task: &TaskId) -> bool {
        self.parked.contains_key(task)
    }

    /// Earliest deadline of a still-parked task. Stale timers are dropped on
    /// the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, task))) = self.timers.peek().copied() {
            if self.parked.get(&task) == Some(&Some(deadline)) {
                return Some(deadline);
            }
            self.timers.pop();
        }
        None
    }

    /// A parked task whose deadline has passed, if any.
    pub(crate) fn expired(&mut self, now: Instant) -> Option<TaskId> {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => {
                self.timers.pop().map(|Reverse((_, task))| task)
            }
            _ => None,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.draining || self.queue.is_shut_down()
    }
}

pub(crate) struct Shared {
    pub(crate) id: WorkerId,
    pub(crate) addr: WorkerAddr,
    pub(crate) config: WorkerConfig,
    pub(crate) registry: Registry,
    state: Mutex<WorkerState>,
    groups: Mutex<HashMap<GroupId, Vec<GroupCallback>>>,
}

impl Shared {
    /// Task bodies run under `catch_unwind`, so a poisoned lock only means a
    /// body panicked somewhere else; the state itself is consistent.
    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the callbacks queued while the state lock was held.
    pub(crate) fn run_callbacks(&self) {
        let pending = self.lock().table.take_pending();
        for callback in pending {
            let result = match callback {
                PendingCallback::Done(f, completion) => {
                    catch_unwind(AssertUnwindSafe(|| f(&completion)))
                }
                PendingCallback::Group(group, completion) => {
                    let callbacks = self
                        .groups
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&group)
                        .cloned()
                        .unwrap_or_default();
                    catch_unwind(AssertUnwindSafe(|| {
                        for f in &callbacks {
                            f(&completion)
                        }
                    }))
                }
            };
            if result.is_err() {
                warn!("completion callback panicked");
            }
        }
    }
}

/// One worker process.
///
/// Built with [`Worker::new`], then either [`run`](Worker::run) as the
/// origin of a job or [`serve`](Worker::serve) tasks handed out by the
/// brokers until the job shuts down.
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    /// Connects to the configured brokers, if any, and performs the INIT
    /// handshake. A worker without brokers runs standalone.
    pub fn new(mut config: WorkerConfig, registry: Registry) -> Result<Self, WorkerError> {
        let id = WorkerId::random();
        let (addr, transport, backlog) = if config.is_standalone() {
            (WorkerAddr(format!("local-{}", id)), None, Vec::new())
        } else {
            let (transport, backlog) = Self::join(&mut config)?;
            (transport.addr().clone(), Some(transport), backlog)
        };
        debug!(%id, %addr, standalone = config.is_standalone(), "worker created");

        let state = WorkerState {
            table: TaskTable::new(id, addr.clone()),
            queue: TaskQueue::new(&config, transport, backlog),
            parked: HashMap::new(),
            timers: BinaryHeap::new(),
            draining: false,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                id,
                addr,
                config,
                registry,
                state: Mutex::new(state),
                groups: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// INIT handshake with the first broker, then with every other broker
    /// configured or learned from its reply. Messages read while waiting for
    /// the reply are handed to the queue.
    fn join(config: &mut WorkerConfig) -> Result<(Transport, Vec<Inbound>), WorkerError> {
        let mut transport = Transport::bind(config)?;
        let info = WorkerInfo {
            addr: transport.addr().clone(),
            origin: config.origin,
            job: config.job(),
        };
        let first = config.brokers[0].clone();
        let idx = transport.connect_broker(&first, Message::Init(info.clone()))?;

        let deadline = Instant::now() + config.connect_timeout;
        let mut backlog = Vec::new();
        let reply = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WorkerError::InitTimeout(first));
            }
            match transport.poll(remaining) {
                Some(Inbound::Message {
                    broker: Some(from),
                    envelope:
                        Envelope {
                            message: Message::InitReply(reply),
                            ..
                        },
                    ..
                }) if from == idx => break reply,
                Some(Inbound::Lost { broker, .. }) if broker == idx => {
                    return Err(NetError::BrokerUnreachable(first).into());
                }
                Some(other) => backlog.push(other),
                None => return Err(WorkerError::InitTimeout(first)),
            }
        };

        if !config.origin {
            if let Some(job) = &reply.job {
                debug!(job = %job.name, "adopting job config");
                config.adopt(job);
            }
        }
        let mut others: Vec<String> = config.brokers[1..].to_vec();
        others.extend(reply.brokers.iter().cloned());
        for broker in others {
            if transport.knows_broker(&broker) {
                continue;
            }
            match transport.connect_broker(&broker, Message::Init(info.clone())) {
                Ok(_) => debug!(%broker, "joined additional broker"),
                Err(e) => warn!(%broker, "could not join broker: {}", e),
            }
        }
        backlog.push(Inbound::Message {
            broker: Some(idx),
            envelope: Envelope::new(WorkerAddr(first), Message::InitReply(reply)),
            received: Instant::now(),
        });
        Ok((transport, backlog))
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Routable address of this worker; `local-…` when standalone.
    pub fn address(&self) -> &WorkerAddr {
        &self.shared.addr
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Registers a universal callback for every task submitted with `group`.
    /// It runs on the worker that executes such a task, and again on its
    /// owner when the two differ.
    pub fn on_group<F>(&self, group: GroupId, f: F)
    where
        F: Fn(&Completion) + Send + Sync + 'static,
    {
        self.shared
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group)
            .or_default()
            .push(Arc::new(f));
    }

    /// Runs `main` as the root task of a job and returns its result once it
    /// and everything it waited on are done. The root stays on this worker;
    /// the tasks it submits are spread over the cluster.
    pub fn run<R, F>(self, main: F) -> Result<R, WorkerError>
    where
        F: FnOnce(&Context) -> Result<R, TaskError> + Send + 'static,
        R: Send + 'static,
    {
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let body: LocalFn = Box::new(move |ctx: &Context| match main(ctx) {
            Ok(value) => {
                *sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                Outcome::Value(Vec::new())
            }
            Err(e) => Outcome::Failure(e.into()),
        });

        let root = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            let id = st
                .table
                .create(TaskId::ROOT, "main", Callable::Local(body), Vec::new());
            st.queue.append_init(&mut st.table, id)?;
            id
        };

        let result = Controller::new(self.shared.clone()).run(Some(root));
        self.close(&result, true);
        result?;

        let outcome = self
            .shared
            .lock()
            .table
            .get(&root)?
            .outcome
            .get()
            .cloned();
        match outcome {
            Some(Outcome::Value(_)) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| {
                    WorkerError::Root(TaskError::InvalidState("root result missing".into()))
                }),
            Some(Outcome::Failure(failure)) => Err(WorkerError::Root(failure.into())),
            None => Err(WorkerError::Root(TaskError::InvalidState(
                "root task never finished".into(),
            ))),
        }
    }

    /// Executes whatever the brokers hand out until SHUTDOWN arrives.
    pub fn serve(self) -> Result<(), WorkerError> {
        let result = Controller::new(self.shared.clone()).run(None);
        self.close(&result, false);
        result
    }

    fn close(&self, result: &Result<(), WorkerError>, origin: bool) {
        let mut st = self.shared.lock();
        match result {
            Ok(()) if origin && self.shared.config.shutdown_on_exit => st.queue.announce_shutdown(),
            Ok(()) | Err(WorkerError::UnexpectedShutdown) => {}
            Err(e) => {
                error!(worker = %self.shared.id, "scheduler failed: {}", e);
                st.queue.announce_down();
            }
        }
        st.queue.shutdown();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("addr", &self.shared.addr)
            .finish()
    }
}
