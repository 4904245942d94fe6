use std::{
    fmt,
    marker::PhantomData,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use super::{
    context::{await_any, Wake},
    table::DoneCallback,
    Shared,
};
use crate::{
    codec::Decode,
    error::TaskError,
    task::{Outcome, TaskId},
};

/// A finished task as seen by a completion callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub id: TaskId,
    pub outcome: Outcome,
}

impl Completion {
    pub fn result<R: Decode>(&self) -> Result<R, TaskError> {
        decode_outcome(&self.outcome)
    }

    pub fn failure(&self) -> Option<TaskError> {
        self.outcome.failure().cloned().map(TaskError::from)
    }
}

/// Handle to a submitted task whose result decodes as `R`.
///
/// Blocking calls on a future suspend the calling task, never the worker:
/// other tasks keep running until the result is available here.
pub struct Future<R> {
    shared: Arc<Shared>,
    id: TaskId,
    outcome: Arc<OnceLock<Outcome>>,
    _result: PhantomData<fn() -> R>,
}

impl<R> Future<R> {
    pub(crate) fn new(shared: Arc<Shared>, id: TaskId, outcome: Arc<OnceLock<Outcome>>) -> Self {
        Self {
            shared,
            id,
            outcome,
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has an outcome, cancellation included.
    pub fn done(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn cancelled(&self) -> bool {
        self.outcome.get().map_or(false, Outcome::is_cancelled)
    }

    /// Whether the task is executing on this worker right now.
    pub fn running(&self) -> bool {
        self.shared.lock().queue.is_in_progress(&self.id)
    }

    /// Cancels the task if it has not started and is still held here.
    /// Returns whether it was cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            st.queue.cancel(&mut st.table, self.id).unwrap_or(false)
        };
        self.shared.run_callbacks();
        cancelled
    }

    /// Done and reconciled with its parent, so safe to consume.
    pub(crate) fn is_ready(&self) -> bool {
        match self.shared.lock().table.get(&self.id) {
            Ok(task) => task.ready,
            Err(_) => self.done(),
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.outcome
            .get()
            .map_or(false, |outcome| outcome.failure().is_some())
    }

    /// Suspends the calling task until this one is ready. A zero timeout
    /// only flushes the queue and drains the network once.
    fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), TaskError> {
        if timeout == Some(Duration::ZERO) {
            {
                let mut guard = self.shared.lock();
                let st = &mut *guard;
                st.queue.flush(&mut st.table)?;
                st.queue.update_queue(&mut st.table)?;
            }
            self.shared.run_callbacks();
            return if self.is_ready() {
                Ok(())
            } else {
                Err(TaskError::Timeout)
            };
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_ready() {
                return Ok(());
            }
            if let Wake::Timeout = await_any(&self.shared, &[self.id], deadline)? {
                return if self.is_ready() {
                    Ok(())
                } else {
                    Err(TaskError::Timeout)
                };
            }
        }
    }

    /// Adds a callback run once with the completion when the task becomes
    /// ready; immediately if it already is.
    pub fn add_done_callback<F>(&self, f: F) -> Result<(), TaskError>
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        let cb: DoneCallback = Box::new(f);
        let immediate = self.shared.lock().table.add_callback(&self.id, cb)?;
        if let Some((cb, completion)) = immediate {
            cb(&completion);
        }
        Ok(())
    }

    /// The task's error, or `None` if it succeeded. Blocks like
    /// [`result`](Self::result).
    pub fn exception(&self) -> Result<Option<TaskError>, TaskError> {
        self.wait_ready(None)?;
        Ok(self
            .outcome
            .get()
            .and_then(Outcome::failure)
            .cloned()
            .map(TaskError::from))
    }
}

impl<R: Decode> Future<R> {
    /// Blocks until the task is ready and returns its value, or re-raises its
    /// failure.
    pub fn result(&self) -> Result<R, TaskError> {
        self.wait_ready(None)?;
        self.value()
    }

    pub fn result_timeout(&self, timeout: Duration) -> Result<R, TaskError> {
        self.wait_ready(Some(timeout))?;
        self.value()
    }

    fn value(&self) -> Result<R, TaskError> {
        match self.outcome.get() {
            Some(outcome) => decode_outcome(outcome),
            None => Err(TaskError::InvalidState(format!(
                "task {} is ready without an outcome",
                self.id
            ))),
        }
    }
}

fn decode_outcome<R: Decode>(outcome: &Outcome) -> Result<R, TaskError> {
    match outcome {
        Outcome::Value(bytes) => Ok(R::decode(bytes)?),
        Outcome::Failure(failure) => Err(failure.clone().into()),
    }
}

impl<R> Drop for Future<R> {
    fn drop(&mut self) {
        self.shared.lock().table.release(&self.id);
    }
}

impl<R> fmt::Debug for Future<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("id", &format_args!("{}", self.id))
            .field("done", &self.done())
            .finish()
    }
}
