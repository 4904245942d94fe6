//! Named task bodies.
//!
//! Code cannot travel between processes, so a task carries the name its body
//! was registered under and every worker resolves that name in its own
//! registry. All workers of a job are expected to register the same set.

use std::{fmt, sync::Arc};

use hashbrown::HashMap;

use crate::{
    codec::{Decode, Encode},
    error::TaskError,
    task::{FailureKind, Outcome, TaskFailure},
    worker::Context,
};

pub(crate) type TaskFn = Arc<dyn Fn(&Context, &[u8]) -> Outcome + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<String, TaskFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `name`, replacing any previous body.
    pub fn register<A, R, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        A: Decode,
        R: Encode,
        F: Fn(&Context, A) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        let body: TaskFn = Arc::new(move |ctx: &Context, args: &[u8]| -> Outcome {
            let args = match A::decode(args) {
                Ok(args) => args,
                Err(e) => {
                    return Outcome::Failure(TaskFailure::new(
                        FailureKind::Serialization,
                        e.to_string(),
                    ))
                }
            };
            match f(ctx, args) {
                Ok(value) => match value.encode() {
                    Ok(bytes) => Outcome::Value(bytes),
                    Err(e) => Outcome::Failure(TaskFailure::new(
                        FailureKind::Serialization,
                        e.to_string(),
                    )),
                },
                Err(error) => Outcome::Failure(error.into()),
            }
        });
        self.functions.insert(name.into(), body);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<A, R, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: Decode,
        R: Encode,
        F: Fn(&Context, A) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&TaskFn> {
        self.functions.get(name)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("functions", &names).finish()
    }
}
