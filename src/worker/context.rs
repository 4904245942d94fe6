//! What a running task body sees of its worker.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::trace;

use super::{
    future::Future,
    scheduler::with_parker,
    table::Callable,
    Resume, Shared,
};
use crate::{
    codec::{Decode, Encode},
    error::TaskError,
    task::{GroupId, TaskId, WorkerAddr, WorkerId},
};

/// Why a suspended task got control back.
pub(crate) enum Wake {
    Ready(TaskId),
    Timeout,
}

/// Suspends the calling task until one of `ids` is ready or `deadline`
/// passes. Returns at once if one of them already is.
pub(crate) fn await_any(
    shared: &Shared,
    ids: &[TaskId],
    deadline: Option<Instant>,
) -> Result<Wake, TaskError> {
    with_parker(|parker| {
        let Some(parker) = parker else {
            return Err(TaskError::InvalidState(
                "blocking on a future outside of a task".into(),
            ));
        };
        let me = parker.task();
        {
            let mut guard = shared.lock();
            let st = &mut *guard;
            if st.is_stopping() {
                return Err(TaskError::Shutdown);
            }
            // a record that is gone was ready and then released
            if let Some(id) = ids.iter().find(|id| st.table.is_ready(id).unwrap_or(true)) {
                return Ok(Wake::Ready(*id));
            }
            if deadline.map_or(false, |d| d <= Instant::now()) {
                return Ok(Wake::Timeout);
            }
            for id in ids {
                st.table.set_waiting_parent(id, me);
            }
            st.park(me, deadline);
        }
        trace!(task = %me, waiting_on = ids.len(), "suspending");

        let resume = parker.suspend();

        {
            let mut guard = shared.lock();
            let st = &mut *guard;
            st.unpark(&me);
            for id in ids {
                st.table.clear_waiting_parent(id, me);
            }
        }
        match resume {
            Resume::Child(id) => Ok(Wake::Ready(id)),
            Resume::Timeout => Ok(Wake::Timeout),
            Resume::Shutdown => Err(TaskError::Shutdown),
            Resume::Start => Err(TaskError::InvalidState(format!(
                "task {} resumed with a start signal",
                me
            ))),
        }
    })
}

/// When [`Context::wait`] returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnWhen {
    FirstCompleted,
    FirstException,
    #[default]
    AllCompleted,
}

/// Ids of the futures passed to [`Context::wait`], split by readiness.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DoneAndNotDone {
    pub done: Vec<TaskId>,
    pub not_done: Vec<TaskId>,
}

/// Yields futures as they become ready, in completion order. Once the
/// deadline passes it yields a single [`TaskError::Timeout`] and stops.
pub struct AsCompleted<R> {
    shared: Arc<Shared>,
    pending: Vec<Future<R>>,
    deadline: Option<Instant>,
    finished: bool,
}

impl<R> AsCompleted<R> {
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Handles whatever already arrived, so replies that came in while this
    /// task was suspended count with the time they arrived.
    fn catch_up(&self) -> Result<(), TaskError> {
        {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            st.queue.update_queue(&mut st.table)?;
        }
        self.shared.run_callbacks();
        Ok(())
    }

    /// Position of the pending future that finished first among the ready
    /// ones.
    fn earliest_ready(&self) -> Option<usize> {
        let st = self.shared.lock();
        self.pending
            .iter()
            .enumerate()
            .filter_map(|(pos, future)| match st.table.get(&future.id()) {
                Ok(task) if task.ready => Some((task.finished_at, pos)),
                Ok(_) => None,
                Err(_) => future.done().then_some((None, pos)),
            })
            .min()
            .map(|(_, pos)| pos)
    }
}

impl<R> Iterator for AsCompleted<R> {
    type Item = Result<Future<R>, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.pending.is_empty() {
            return None;
        }
        loop {
            if let Err(e) = self.catch_up() {
                self.finished = true;
                return Some(Err(e));
            }
            if let Some(pos) = self.earliest_ready() {
                return Some(Ok(self.pending.remove(pos)));
            }
            let ids: Vec<TaskId> = self.pending.iter().map(Future::id).collect();
            match await_any(&self.shared, &ids, self.deadline) {
                Ok(Wake::Ready(_)) => {}
                Ok(Wake::Timeout) => {
                    self.finished = true;
                    return Some(Err(TaskError::Timeout));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Handle given to every task body: submits children, waits on them and
/// reads job-wide shared constants.
pub struct Context {
    shared: Arc<Shared>,
    task: TaskId,
}

impl Context {
    pub(crate) fn new(shared: Arc<Shared>, task: TaskId) -> Self {
        Self { shared, task }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn worker_id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn worker_addr(&self) -> &WorkerAddr {
        &self.shared.addr
    }

    /// Submits `function(args)` as a child of the current task.
    pub fn submit<A, R>(&self, function: &str, args: &A) -> Result<Future<R>, TaskError>
    where
        A: Encode,
        R: Decode,
    {
        self.submit_grouped(function, args, &[])
    }

    /// Like [`submit`](Self::submit), tagging the task with callback groups
    /// whose universal callbacks fire on completion.
    pub fn submit_grouped<A, R>(
        &self,
        function: &str,
        args: &A,
        groups: &[GroupId],
    ) -> Result<Future<R>, TaskError>
    where
        A: Encode,
        R: Decode,
    {
        if !self.shared.registry.contains(function) {
            return Err(TaskError::UnknownFunction(function.to_owned()));
        }
        let args = args.encode()?;
        let mut guard = self.shared.lock();
        let st = &mut *guard;
        if st.is_stopping() {
            return Err(TaskError::Shutdown);
        }
        let callable = Callable::Named {
            function: function.to_owned(),
            args,
        };
        let id = st
            .table
            .create(self.task, function, callable, groups.to_vec());
        st.queue.append_init(&mut st.table, id)?;
        let outcome = st.table.get(&id)?.outcome.clone();
        drop(guard);
        Ok(Future::new(self.shared.clone(), id, outcome))
    }

    /// Runs `function` over every argument and returns the results in
    /// argument order. The first failure is re-raised.
    pub fn map<A, R, I>(&self, function: &str, args: I) -> Result<Vec<R>, TaskError>
    where
        A: Encode,
        R: Decode,
        I: IntoIterator<Item = A>,
    {
        let futures = self.submit_all::<A, R, I>(function, args)?;
        futures.iter().map(Future::result).collect()
    }

    /// Like [`map`](Self::map), yielding results in completion order.
    pub fn map_as_completed<A, R, I>(
        &self,
        function: &str,
        args: I,
    ) -> Result<impl Iterator<Item = Result<R, TaskError>>, TaskError>
    where
        A: Encode,
        R: Decode,
        I: IntoIterator<Item = A>,
    {
        let futures = self.submit_all::<A, R, I>(function, args)?;
        Ok(self
            .as_completed(futures, None)
            .map(|done| done.and_then(|future| future.result())))
    }

    /// Folds the results of `function` over `args` with `reduce` as they
    /// complete. `None` when `args` is empty.
    pub fn map_reduce<A, R, I, F>(
        &self,
        function: &str,
        args: I,
        mut reduce: F,
    ) -> Result<Option<R>, TaskError>
    where
        A: Encode,
        R: Decode,
        I: IntoIterator<Item = A>,
        F: FnMut(R, R) -> R,
    {
        let mut acc = None;
        for value in self.map_as_completed::<A, R, I>(function, args)? {
            let value = value?;
            acc = Some(match acc {
                Some(acc) => reduce(acc, value),
                None => value,
            });
        }
        Ok(acc)
    }

    fn submit_all<A, R, I>(&self, function: &str, args: I) -> Result<Vec<Future<R>>, TaskError>
    where
        A: Encode,
        R: Decode,
        I: IntoIterator<Item = A>,
    {
        args.into_iter()
            .map(|arg| self.submit(function, &arg))
            .collect()
    }

    pub fn as_completed<R>(
        &self,
        futures: Vec<Future<R>>,
        timeout: Option<Duration>,
    ) -> AsCompleted<R> {
        AsCompleted {
            shared: self.shared.clone(),
            pending: futures,
            deadline: timeout.map(|t| Instant::now() + t),
            finished: false,
        }
    }

    /// Waits until `return_when` holds for `futures` or `timeout` passes,
    /// and reports which are done. A zero timeout flushes the queue and
    /// drains the network once without suspending.
    pub fn wait<R>(
        &self,
        futures: &[Future<R>],
        timeout: Option<Duration>,
        return_when: ReturnWhen,
    ) -> Result<DoneAndNotDone, TaskError> {
        if timeout == Some(Duration::ZERO) {
            {
                let mut guard = self.shared.lock();
                let st = &mut *guard;
                st.queue.flush(&mut st.table)?;
                st.queue.update_queue(&mut st.table)?;
            }
            self.shared.run_callbacks();
            return Ok(partition(futures));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let split = partition(futures);
            let satisfied = match return_when {
                ReturnWhen::FirstCompleted => !split.done.is_empty(),
                ReturnWhen::FirstException => futures.iter().any(|f| f.is_ready() && f.is_failed()),
                ReturnWhen::AllCompleted => false,
            };
            if satisfied || split.not_done.is_empty() {
                return Ok(split);
            }
            if let Wake::Timeout = await_any(&self.shared, &split.not_done, deadline)? {
                return Ok(partition(futures));
            }
        }
    }

    /// Publishes a job-wide constant. Each name can be set once.
    pub fn set_shared<T: Encode>(&self, name: &str, value: &T) -> Result<(), TaskError> {
        let bytes = value.encode()?;
        let mut st = self.shared.lock();
        if st.queue.shared(name).is_some() {
            return Err(TaskError::InvalidState(format!(
                "shared constant `{}` is already set",
                name
            )));
        }
        st.queue
            .publish(name.to_owned(), bytes, self.shared.addr.clone())?;
        Ok(())
    }

    /// Reads a job-wide constant, polling the network until it shows up or
    /// `timeout` passes. Does not suspend the task.
    pub fn shared<T: Decode>(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, TaskError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut guard = self.shared.lock();
                let st = &mut *guard;
                st.queue.update_queue(&mut st.table)?;
                if let Some(bytes) = st.queue.shared(name) {
                    return Ok(Some(T::decode(bytes)?));
                }
                if !st.queue.is_networked() {
                    return Ok(None);
                }
                let now = Instant::now();
                let wait = match deadline {
                    Some(d) if d <= now => return Ok(None),
                    Some(d) => (d - now).min(self.shared.config.poll_interval),
                    None => self.shared.config.poll_interval,
                };
                st.queue.wait_inbound(&mut st.table, wait)?;
            }
            self.shared.run_callbacks();
        }
    }
}

fn partition<R>(futures: &[Future<R>]) -> DoneAndNotDone {
    let mut split = DoneAndNotDone::default();
    for future in futures {
        if future.is_ready() {
            split.done.push(future.id());
        } else {
            split.not_done.push(future.id());
        }
    }
    split
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("task", &format_args!("{}", self.task))
            .field("worker", &self.shared.id)
            .finish()
    }
}
