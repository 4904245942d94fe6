//! The controller loop and the continuations it hands the baton to.
//!
//! Every started task gets an OS thread. The thread only runs while the
//! controller waits on it: it is started or resumed through its own channel
//! and gives control back by sending its id on the shared yield channel.
//! Exactly one side holds the baton at a time.

use std::{
    any::Any,
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use tracing::{debug, debug_span, error, trace, warn};

use super::{
    context::Context,
    queue::Finalized,
    table::Callable,
    Resume, Shared, WorkerState,
};
use crate::{
    error::{QueueError, WorkerError},
    task::{FailureKind, Outcome, TaskFailure, TaskId},
};

/// How long an unwinding continuation gets to hand the baton back at exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

thread_local! {
    static PARKER: RefCell<Option<Parker>> = RefCell::new(None);
}

/// A continuation's end of the baton.
pub(crate) struct Parker {
    task: TaskId,
    resume: Receiver<Resume>,
    yield_tx: Sender<TaskId>,
}

impl Parker {
    pub(crate) fn task(&self) -> TaskId {
        self.task
    }

    /// Hands the baton to the controller and blocks until resumed.
    pub(crate) fn suspend(&self) -> Resume {
        if self.yield_tx.send(self.task).is_err() {
            return Resume::Shutdown;
        }
        self.resume.recv().unwrap_or(Resume::Shutdown)
    }
}

/// Runs `f` with the parker of the task running on this thread, if any.
pub(crate) fn with_parker<T>(f: impl FnOnce(Option<&Parker>) -> T) -> T {
    PARKER.with(|parker| f(parker.borrow().as_ref()))
}

/// Gives the baton back when the task body returns or unwinds.
struct YieldOnExit {
    task: TaskId,
    tx: Sender<TaskId>,
}

impl Drop for YieldOnExit {
    fn drop(&mut self) {
        let _ = self.tx.send(self.task);
    }
}

enum Step {
    /// Nothing runnable before the next timer.
    Idle,
    Start(TaskId, Callable),
    Resume(TaskId, Resume),
    /// The popped task needed no switch.
    Consumed,
}

pub(crate) struct Controller {
    shared: Arc<Shared>,
    continuations: HashMap<TaskId, Sender<Resume>>,
    yield_tx: Sender<TaskId>,
    yield_rx: Receiver<TaskId>,
}

impl Controller {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let (yield_tx, yield_rx) = mpsc::channel();
        Self {
            shared,
            continuations: HashMap::new(),
            yield_tx,
            yield_rx,
        }
    }

    /// Schedules until `root` is ready, or for a worker without a root until
    /// the job shuts down.
    pub(crate) fn run(&mut self, root: Option<TaskId>) -> Result<(), WorkerError> {
        let span = debug_span!("controller", worker = %self.shared.id);
        let _guard = span.enter();
        let result = self.schedule(root);
        self.drain();
        result
    }

    fn schedule(&mut self, root: Option<TaskId>) -> Result<(), WorkerError> {
        loop {
            let step = {
                let mut guard = self.shared.lock();
                let st = &mut *guard;
                if let Some(root) = root {
                    if st.table.is_ready(&root)? {
                        debug!(%root, "root task ready");
                        return Ok(());
                    }
                }
                match st.expired(Instant::now()) {
                    Some(task) => Step::Resume(task, Resume::Timeout),
                    None => {
                        let deadline = st.next_deadline();
                        match st.queue.pop(&mut st.table, deadline) {
                            Ok(Some(id)) => classify(st, id)?,
                            Ok(None) => Step::Idle,
                            Err(QueueError::Shutdown) if root.is_some() => {
                                return Err(WorkerError::UnexpectedShutdown)
                            }
                            Err(QueueError::Shutdown) => {
                                debug!("job shut down");
                                return Ok(());
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            };
            self.shared.run_callbacks();

            match step {
                Step::Idle | Step::Consumed => {}
                Step::Start(id, callable) => {
                    self.start(id, callable)?;
                    self.settle(id)?;
                }
                Step::Resume(id, resume) => {
                    self.switch(id, resume)?;
                    self.settle(id)?;
                }
            }
        }
    }

    fn start(&mut self, id: TaskId, callable: Callable) -> Result<(), WorkerError> {
        let (resume_tx, resume_rx) = mpsc::channel();
        let parker = Parker {
            task: id,
            resume: resume_rx,
            yield_tx: self.yield_tx.clone(),
        };
        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("shoal-task-{}", id.seq))
            .stack_size(self.shared.config.stack_size)
            .spawn(move || run_task(shared, callable, parker))
            .map_err(WorkerError::Spawn)?;
        self.continuations.insert(id, resume_tx);
        trace!(%id, "started");
        self.switch(id, Resume::Start)
    }

    /// Hands the baton to `target` and waits until it comes back.
    fn switch(&mut self, target: TaskId, resume: Resume) -> Result<(), WorkerError> {
        let tx = self
            .continuations
            .get(&target)
            .ok_or(WorkerError::ContinuationLost(target))?;
        tx.send(resume)
            .map_err(|_| WorkerError::ContinuationLost(target))?;
        match self.yield_rx.recv() {
            Ok(back) if back == target => Ok(()),
            Ok(other) => {
                error!(expected = %target, got = %other, "baton returned by the wrong task");
                Err(WorkerError::ContinuationLost(target))
            }
            Err(_) => Err(WorkerError::ContinuationLost(target)),
        }
    }

    /// Follows up on a task that just gave the baton back. A finished task is
    /// finalized, and when its parent is parked on it the parent is resumed
    /// straight away, which may finish the parent in turn.
    fn settle(&mut self, mut current: TaskId) -> Result<(), WorkerError> {
        loop {
            let next = {
                let mut guard = self.shared.lock();
                let st = &mut *guard;
                if !st.table.get(&current)?.is_done() {
                    if !st.is_parked(&current) {
                        return Err(WorkerError::ContinuationLost(current));
                    }
                    None
                } else {
                    self.continuations.remove(&current);
                    match st.queue.finalize_future(&mut st.table, current)? {
                        Finalized::Sent => None,
                        Finalized::Local => {
                            let parent = st
                                .table
                                .take_waiting_parent(&current)
                                .filter(|parent| st.is_parked(parent));
                            if parent.is_none() {
                                if st.table.get(&current)?.detached {
                                    st.table.remove(&current);
                                } else {
                                    st.queue.append_ready(&st.table, current)?;
                                }
                            }
                            parent
                        }
                    }
                }
            };
            self.shared.run_callbacks();

            match next {
                Some(parent) => {
                    trace!(task = %current, %parent, "resuming parent");
                    self.switch(parent, Resume::Child(current))?;
                    current = parent;
                }
                None => return Ok(()),
            }
        }
    }

    /// Unwinds every continuation still parked, so no runner thread outlives
    /// the worker.
    fn drain(&mut self) {
        self.shared.lock().draining = true;
        let parked: Vec<(TaskId, Sender<Resume>)> = self.continuations.drain().collect();
        if !parked.is_empty() {
            debug!(count = parked.len(), "unwinding suspended tasks");
        }
        for (id, tx) in parked {
            if tx.send(Resume::Shutdown).is_err() {
                continue;
            }
            if self.yield_rx.recv_timeout(DRAIN_TIMEOUT).is_err() {
                warn!(%id, "suspended task did not unwind");
            }
        }
    }
}

/// Decides what to do with a task popped from the queue.
fn classify(st: &mut WorkerState, id: TaskId) -> Result<Step, WorkerError> {
    let Ok(task) = st.table.get_mut(&id) else {
        // released and dropped while queued
        return Ok(Step::Consumed);
    };
    if task.ready {
        let parent = task.waiting_parent.take();
        return Ok(match parent {
            Some(parent) if st.is_parked(&parent) => Step::Resume(parent, Resume::Child(id)),
            _ => {
                st.table.remove_if_detached(&id);
                Step::Consumed
            }
        });
    }
    match task.callable.take() {
        Some(callable) => Ok(Step::Start(id, callable)),
        None => Err(QueueError::InvalidTaskState {
            id,
            reason: "popped a task with nothing to run",
        }
        .into()),
    }
}

fn run_task(shared: Arc<Shared>, callable: Callable, parker: Parker) {
    let id = parker.task;
    let _yield = YieldOnExit {
        task: id,
        tx: parker.yield_tx.clone(),
    };
    let first = parker.resume.recv();
    PARKER.with(|slot| *slot.borrow_mut() = Some(parker));
    if !matches!(first, Ok(Resume::Start)) {
        return;
    }

    let ctx = Context::new(shared.clone(), id);
    let began = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| execute(&shared, &ctx, callable)))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(%id, "task panicked: {}", message);
            Outcome::Failure(TaskFailure::new(FailureKind::Panicked, message))
        });
    if let Err(e) = shared.lock().table.complete(&id, outcome, began.elapsed()) {
        error!(%id, "could not record outcome: {}", e);
    }
}

fn execute(shared: &Shared, ctx: &Context, callable: Callable) -> Outcome {
    match callable {
        Callable::Named { function, args } => match shared.registry.get(&function).cloned() {
            Some(body) => body(ctx, &args),
            None => Outcome::Failure(TaskFailure::new(FailureKind::UnknownFunction, function)),
        },
        Callable::Local(body) => body(ctx),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}
