use std::{
    cmp::Ordering,
    fmt,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use tracing::{trace, warn};

use super::{context::Context, future::Completion};
use crate::{
    error::QueueError,
    task::{GroupId, Outcome, TaskEnvelope, TaskId, WorkerAddr, WorkerId},
};

pub(crate) type DoneCallback = Box<dyn FnOnce(&Completion) + Send>;
pub(crate) type LocalFn = Box<dyn FnOnce(&Context) -> Outcome + Send>;

/// What a task runs. Only named callables can leave the worker.
pub(crate) enum Callable {
    Named { function: String, args: Vec<u8> },
    Local(LocalFn),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Named { function, args } => {
                write!(f, "{}({} bytes)", function, args.len())
            }
            Callable::Local(_) => f.write_str("<local>"),
        }
    }
}

/// Scheduler-side record of one task.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) parent: TaskId,
    pub(crate) owner: WorkerAddr,
    /// Dropped once the task starts; kept until then so it can be shipped
    /// again.
    pub(crate) callable: Option<Callable>,
    pub(crate) function: String,
    pub(crate) groups: Vec<GroupId>,
    pub(crate) outcome: Arc<OnceLock<Outcome>>,
    pub(crate) executor: Option<WorkerId>,
    pub(crate) started: bool,
    pub(crate) ready: bool,
    /// Offered to a broker and not yet answered.
    pub(crate) shipped: bool,
    /// Broker link a remote task arrived on.
    pub(crate) via_broker: Option<usize>,
    pub(crate) children: HashSet<TaskId>,
    pub(crate) callbacks: Vec<DoneCallback>,
    /// Parent continuation parked on this task, if any.
    pub(crate) waiting_parent: Option<TaskId>,
    /// Nobody holds a handle any more; drop the record once ready.
    pub(crate) detached: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<Instant>,
    /// When the outcome became known here: on return for tasks run locally,
    /// on arrival of the reply otherwise.
    pub(crate) finished_at: Option<Instant>,
    pub(crate) execution: Option<Duration>,
}

impl Task {
    pub(crate) fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub(crate) fn is_movable(&self) -> bool {
        !self.started && !self.is_done()
    }

    /// Wire form of the task. `None` for local closures, which cannot be
    /// shipped.
    pub(crate) fn envelope(&self) -> Option<TaskEnvelope> {
        let args = match &self.callable {
            Some(Callable::Named { args, .. }) => args.clone(),
            Some(Callable::Local(_)) => return None,
            None if self.is_done() => Vec::new(),
            None => return None,
        };
        Some(TaskEnvelope {
            id: self.id,
            parent: self.parent,
            owner: self.owner.clone(),
            function: self.function.clone(),
            args,
            groups: self.groups.clone(),
            created_at: self.created_at.timestamp_micros(),
            outcome: self.outcome.get().cloned(),
            executor: self.executor,
            execution_micros: self.execution.map(|d| d.as_micros() as u64),
        })
    }

    fn completion(&self) -> Option<Completion> {
        self.outcome.get().map(|outcome| Completion {
            id: self.id,
            outcome: outcome.clone(),
        })
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    /// Creation order, for debug listings only.
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &format_args!("{}", self.id))
            .field("parent", &format_args!("{}", self.parent))
            .field("function", &self.function)
            .field("done", &self.is_done())
            .field("ready", &self.ready)
            .field("started", &self.started)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Callbacks collected under the state lock and run after it is released.
pub(crate) enum PendingCallback {
    Done(DoneCallback, Completion),
    Group(GroupId, Completion),
}

/// Every task this worker knows about, by id. Lookups never create entries.
pub(crate) struct TaskTable {
    worker: WorkerId,
    owner: WorkerAddr,
    next_seq: u64,
    tasks: HashMap<TaskId, Task>,
    pending: Vec<PendingCallback>,
}

impl TaskTable {
    pub(crate) fn new(worker: WorkerId, owner: WorkerAddr) -> Self {
        Self {
            worker,
            owner,
            next_seq: 0,
            tasks: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Registers a fresh task owned by this worker under the next sequence
    /// number, and records it as a child of `parent` when the parent lives
    /// here.
    pub(crate) fn create(
        &mut self,
        parent: TaskId,
        function: impl Into<String>,
        callable: Callable,
        groups: Vec<GroupId>,
    ) -> TaskId {
        self.next_seq += 1;
        let id = TaskId::new(self.worker, self.next_seq);
        let task = Task {
            id,
            parent,
            owner: self.owner.clone(),
            callable: Some(callable),
            function: function.into(),
            groups,
            outcome: Arc::new(OnceLock::new()),
            executor: None,
            started: false,
            ready: false,
            shipped: false,
            via_broker: None,
            children: HashSet::new(),
            callbacks: Vec::new(),
            waiting_parent: None,
            detached: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            execution: None,
        };
        if let Some(parent) = self.tasks.get_mut(&parent) {
            parent.children.insert(id);
        }
        trace!(%id, %parent, "task created");
        self.tasks.insert(id, task);
        id
    }

    /// Registers a task received from the network. Returns `false` when the
    /// id is already known (duplicate delivery).
    pub(crate) fn insert_remote(
        &mut self,
        envelope: TaskEnvelope,
        via_broker: Option<usize>,
    ) -> bool {
        if self.tasks.contains_key(&envelope.id) {
            return false;
        }
        let created_at = envelope.created_at();
        let task = Task {
            id: envelope.id,
            parent: envelope.parent,
            owner: envelope.owner,
            callable: Some(Callable::Named {
                function: envelope.function.clone(),
                args: envelope.args,
            }),
            function: envelope.function,
            groups: envelope.groups,
            outcome: Arc::new(OnceLock::new()),
            executor: None,
            started: false,
            ready: false,
            shipped: false,
            via_broker,
            children: HashSet::new(),
            callbacks: Vec::new(),
            waiting_parent: None,
            detached: false,
            created_at,
            started_at: None,
            finished_at: None,
            execution: None,
        };
        self.tasks.insert(task.id, task);
        true
    }

    pub(crate) fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub(crate) fn get(&self, id: &TaskId) -> Result<&Task, QueueError> {
        self.tasks.get(id).ok_or(QueueError::TaskNotFound(*id))
    }

    pub(crate) fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task, QueueError> {
        self.tasks.get_mut(id).ok_or(QueueError::TaskNotFound(*id))
    }

    pub(crate) fn is_owned(&self, id: &TaskId) -> bool {
        id.worker == self.worker
    }

    pub(crate) fn is_ready(&self, id: &TaskId) -> Result<bool, QueueError> {
        self.get(id).map(|task| task.ready)
    }

    /// Records the outcome of a task that just ran here.
    pub(crate) fn complete(
        &mut self,
        id: &TaskId,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Result<(), QueueError> {
        let worker = self.worker;
        let task = self.get_mut(id)?;
        if task.outcome.set(outcome).is_err() {
            return Err(QueueError::InvalidTaskState {
                id: *id,
                reason: "completed twice",
            });
        }
        task.executor = Some(worker);
        task.execution = Some(elapsed);
        task.finished_at = Some(Instant::now());
        task.callable = None;
        self.queue_group_callbacks(id);
        Ok(())
    }

    /// Copies the outcome of a reply onto the local record. Returns `false`
    /// for a duplicate reply of a task that is already done.
    pub(crate) fn reconcile(
        &mut self,
        envelope: TaskEnvelope,
        received: Instant,
    ) -> Result<bool, QueueError> {
        let worker = self.worker;
        let task = self.get_mut(&envelope.id)?;
        let outcome = envelope.outcome.ok_or(QueueError::InvalidTaskState {
            id: envelope.id,
            reason: "reply carries no outcome",
        })?;
        if task.outcome.set(outcome).is_err() {
            return Ok(false);
        }
        task.executor = envelope.executor;
        task.execution = envelope.execution_micros.map(Duration::from_micros);
        task.finished_at = Some(received);
        task.callable = None;
        task.shipped = false;
        if task.executor != Some(worker) {
            // executed elsewhere: universal callbacks run here too
            self.queue_group_callbacks(&envelope.id);
        }
        Ok(true)
    }

    /// Sets the outcome of a task that never ran.
    pub(crate) fn resolve(&mut self, id: &TaskId, outcome: Outcome) -> Result<(), QueueError> {
        let task = self.get_mut(id)?;
        if task.outcome.set(outcome).is_err() {
            return Err(QueueError::InvalidTaskState {
                id: *id,
                reason: "already done",
            });
        }
        task.finished_at = Some(Instant::now());
        task.callable = None;
        Ok(())
    }

    /// Marks a done task ready: it leaves its parent's children set and its
    /// standard callbacks are queued in registration order.
    pub(crate) fn mark_ready(&mut self, id: &TaskId) -> Result<(), QueueError> {
        let task = self.get_mut(id)?;
        if !task.is_done() {
            return Err(QueueError::InvalidTaskState {
                id: *id,
                reason: "ready before done",
            });
        }
        if task.ready {
            return Err(QueueError::InvalidTaskState {
                id: *id,
                reason: "already ready",
            });
        }
        task.ready = true;
        let parent = task.parent;
        let callbacks = std::mem::take(&mut task.callbacks);
        let completion = task.completion();
        warn_orphans(task);

        if let Some(completion) = completion {
            for cb in callbacks {
                self.pending
                    .push(PendingCallback::Done(cb, completion.clone()));
            }
        }
        if let Some(parent) = self.tasks.get_mut(&parent) {
            parent.children.remove(id);
        }
        Ok(())
    }

    /// Adds a standard callback. When the task is already ready the callback
    /// is handed back with its completion, to be run by the caller.
    pub(crate) fn add_callback(
        &mut self,
        id: &TaskId,
        cb: DoneCallback,
    ) -> Result<Option<(DoneCallback, Completion)>, QueueError> {
        let task = self.get_mut(id)?;
        match task.completion() {
            Some(completion) if task.ready => Ok(Some((cb, completion))),
            _ => {
                task.callbacks.push(cb);
                Ok(None)
            }
        }
    }

    pub(crate) fn set_waiting_parent(&mut self, child: &TaskId, parent: TaskId) {
        if let Some(task) = self.tasks.get_mut(child) {
            task.waiting_parent = Some(parent);
        }
    }

    pub(crate) fn clear_waiting_parent(&mut self, child: &TaskId, parent: TaskId) {
        if let Some(task) = self.tasks.get_mut(child) {
            if task.waiting_parent == Some(parent) {
                task.waiting_parent = None;
            }
        }
    }

    pub(crate) fn take_waiting_parent(&mut self, child: &TaskId) -> Option<TaskId> {
        self.tasks
            .get_mut(child)
            .and_then(|task| task.waiting_parent.take())
    }

    /// The handle to `id` was dropped: forget the task now if it is ready,
    /// otherwise as soon as it becomes ready.
    pub(crate) fn release(&mut self, id: &TaskId) {
        let ready = match self.tasks.get_mut(id) {
            Some(task) => {
                task.detached = true;
                task.ready
            }
            None => return,
        };
        if ready {
            self.remove(id);
        }
    }

    pub(crate) fn remove_if_detached(&mut self, id: &TaskId) {
        if self.tasks.get(id).map_or(false, |task| task.detached) {
            self.remove(id);
        }
    }

    pub(crate) fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        warn_orphans(&task);
        trace!(%id, "task removed");
        Some(task)
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingCallback> {
        std::mem::take(&mut self.pending)
    }

    fn queue_group_callbacks(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get(id) {
            if let Some(completion) = task.completion() {
                for group in &task.groups {
                    self.pending
                        .push(PendingCallback::Group(*group, completion.clone()));
                }
            }
        }
    }
}

fn warn_orphans(task: &Task) {
    if !task.children.is_empty() {
        warn!(
            id = %task.id,
            orphans = task.children.len(),
            "task finalized with uncollected children"
        );
    }
}
