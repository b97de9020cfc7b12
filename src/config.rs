use crate::executor::ExecutorError;
use core::num::NonZeroUsize;
use std::{borrow::Cow, env, thread};

/// Environment variable overriding the number of worker threads.
pub const WORKERS_ENV: &str = "TASK_GRAPH_WORKERS";
/// Environment variable overriding the worker thread stack size in bytes.
pub const STACK_SIZE_ENV: &str = "TASK_GRAPH_STACK_SIZE";

const DEFAULT_THREAD_NAME: &str = "task-graph";

/// Construction parameters of a [`TaskExecutor`](crate::executor::TaskExecutor).
///
/// The pool size is fixed for the executor's whole lifetime.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    worker_count: NonZeroUsize,
    thread_name: Cow<'static, str>,
    stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            thread_name: Cow::Borrowed(DEFAULT_THREAD_NAME),
            stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Default configuration overridden by [`WORKERS_ENV`] and
    /// [`STACK_SIZE_ENV`] when they are set.
    ///
    /// # Errors
    /// If a variable is set but is not a positive integer.
    pub fn from_env() -> Result<Self, ExecutorError> {
        let mut config = Self::default();
        if let Some(workers) = read_env(WORKERS_ENV)? {
            config.worker_count = workers;
        }
        if let Some(stack_size) = read_env(STACK_SIZE_ENV)? {
            config.stack_size = Some(stack_size.get());
        }
        Ok(config)
    }

    /// Sets the number of worker threads.
    pub fn with_worker_count(mut self, worker_count: NonZeroUsize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Sets the prefix of worker thread names. Workers are named
    /// `{prefix}-{index}`.
    pub fn with_thread_name(mut self, thread_name: impl Into<Cow<'static, str>>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Sets the stack size of worker threads in bytes.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> NonZeroUsize {
        self.worker_count
    }

    /// Prefix of worker thread names.
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Stack size of worker threads, if overridden.
    #[must_use]
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }
}

fn read_env(var: &'static str) -> Result<Option<NonZeroUsize>, ExecutorError> {
    let Ok(value) = env::var(var) else {
        return Ok(None);
    };
    parse_positive(var, &value).map(Some)
}

fn parse_positive(var: &'static str, value: &str) -> Result<NonZeroUsize, ExecutorError> {
    value
        .trim()
        .parse::<NonZeroUsize>()
        .map_err(|_| ExecutorError::InvalidEnv {
            var,
            value: value.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ExecutorConfig::default()
            .with_worker_count(NonZeroUsize::new(3).unwrap())
            .with_thread_name("render")
            .with_stack_size(1 << 20);
        assert_eq!(config.worker_count().get(), 3);
        assert_eq!(config.thread_name(), "render");
        assert_eq!(config.stack_size(), Some(1 << 20));
    }

    #[test]
    fn default_has_at_least_one_worker() {
        let config = ExecutorConfig::default();
        assert!(config.worker_count().get() >= 1);
        assert_eq!(config.thread_name(), DEFAULT_THREAD_NAME);
        assert_eq!(config.stack_size(), None);
    }

    #[test]
    fn env_values_must_be_positive_integers() {
        assert_eq!(parse_positive(WORKERS_ENV, " 8 ").unwrap().get(), 8);
        for bad in ["0", "-1", "many", ""] {
            let err = parse_positive(WORKERS_ENV, bad).unwrap_err();
            assert!(
                matches!(
                    &err,
                    ExecutorError::InvalidEnv { var, value } if *var == WORKERS_ENV && value == bad
                ),
                "unexpected error for {bad:?}: {err:?}"
            );
        }
    }
}
