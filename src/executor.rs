mod run;

use crate::{
    config::ExecutorConfig,
    event::TaskGraphEvent,
    executor::run::GraphRun,
    graph::CompiledTaskGraph,
    types::ExecutorId,
};
use derive_more::Debug;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error produced while constructing a [`TaskExecutor`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The worker threads could not be started.
    #[error("failed to start task executor worker threads")]
    ThreadPool(#[from] ThreadPoolBuildError),
    /// [`TaskExecutor::init_default`] was called after the default executor
    /// was installed.
    #[error("the default task executor is already initialized")]
    DefaultAlreadyInitialized,
    /// A configuration environment variable holds an invalid value.
    #[error("environment variable {var} must be a positive integer, got {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Rejected value.
        value: String,
    },
}

/// Snapshot of an executor's counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Submissions whose tasks have not all finished.
    pub graphs_in_flight: usize,
    /// Submissions that ran to completion.
    pub graphs_completed: u64,
    /// Task invocations, including panicked ones.
    pub tasks_executed: u64,
    /// Task invocations that panicked.
    pub tasks_panicked: u64,
}

/// Fixed pool of worker threads running submitted task graphs.
///
/// Workers execute ready tasks to completion and release their successors.
/// There is no ordering between tasks without a path of edges between
/// them, nor between independently submitted graphs.
///
/// Most callers share the process-wide [default
/// instance](Self::default_instance); subsystems wanting an isolated pool
/// construct their own and submit with
/// [`TaskGraph::submit_on_executor`](crate::graph::TaskGraph::submit_on_executor).
#[must_use]
#[derive(Debug)]
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
}

/// State shared between the executor handle and the runs it drives.
#[derive(Debug)]
struct ExecutorShared {
    id: ExecutorId,
    worker_count: usize,
    #[debug(skip)]
    pool: ThreadPool,
    /// Submissions not yet completed. Guarded by a mutex so `shutdown` can
    /// wait for it to drain.
    graphs_in_flight: Mutex<usize>,
    #[debug(skip)]
    idle: Condvar,
    graphs_completed: AtomicU64,
    tasks_executed: AtomicU64,
    tasks_panicked: AtomicU64,
}

static DEFAULT_EXECUTOR: OnceLock<TaskExecutor> = OnceLock::new();

impl TaskExecutor {
    /// Starts `config.worker_count()` worker threads.
    ///
    /// # Errors
    /// If the threads cannot be spawned.
    pub fn new(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let id = ExecutorId::next();
        let worker_count = config.worker_count().get();
        let thread_name = config.thread_name().to_owned();
        let mut builder = ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(move |idx| format!("{thread_name}-{idx}"));
        if let Some(stack_size) = config.stack_size() {
            builder = builder.stack_size(stack_size);
        }
        let pool = builder.build()?;
        info!(
            executor = id.get(),
            workers = worker_count,
            "Started task executor"
        );
        Ok(Self {
            shared: Arc::new(ExecutorShared {
                id,
                worker_count,
                pool,
                graphs_in_flight: Mutex::new(0),
                idle: Condvar::new(),
                graphs_completed: AtomicU64::new(0),
                tasks_executed: AtomicU64::new(0),
                tasks_panicked: AtomicU64::new(0),
            }),
        })
    }

    /// Installs the process-wide default executor.
    ///
    /// Call it during startup, before anything submits to the default
    /// executor. The default executor lives until the process exits.
    ///
    /// # Errors
    /// If the default executor is already installed, or its threads cannot
    /// be spawned.
    pub fn init_default(config: &ExecutorConfig) -> Result<&'static Self, ExecutorError> {
        if DEFAULT_EXECUTOR.get().is_some() {
            return Err(ExecutorError::DefaultAlreadyInitialized);
        }
        DEFAULT_EXECUTOR
            .set(Self::new(config)?)
            .map_err(|_| ExecutorError::DefaultAlreadyInitialized)?;
        Ok(DEFAULT_EXECUTOR
            .get()
            .expect("TaskExecutor::init_default: [1]"))
    }

    /// The process-wide default executor.
    ///
    /// If [`init_default`](Self::init_default) was not called, an executor
    /// configured by [`ExecutorConfig::from_env`] is installed on first use.
    ///
    /// # Panics
    /// If the default executor has to be created and its threads cannot be
    /// spawned.
    pub fn default_instance() -> &'static Self {
        DEFAULT_EXECUTOR.get_or_init(|| {
            let config = ExecutorConfig::from_env().unwrap_or_else(|err| {
                warn!(%err, "Ignoring task executor environment configuration");
                ExecutorConfig::default()
            });
            Self::new(&config).expect("Failed to start the default task executor")
        })
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> ExecutorId {
        self.shared.id
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Index of the calling worker thread, or `None` when called from a
    /// thread that does not belong to this executor.
    #[must_use]
    pub fn current_worker_index(&self) -> Option<usize> {
        self.shared.pool.current_thread_index()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        let shared = &*self.shared;
        ExecutorStats {
            graphs_in_flight: *shared.lock_in_flight(),
            graphs_completed: shared.graphs_completed.load(Ordering::Relaxed),
            tasks_executed: shared.tasks_executed.load(Ordering::Relaxed),
            tasks_panicked: shared.tasks_panicked.load(Ordering::Relaxed),
        }
    }

    /// Blocks until every graph submitted to this executor completed, then
    /// stops the worker threads.
    pub fn shutdown(self) {
        let shared = &*self.shared;
        let mut in_flight = shared.lock_in_flight();
        while *in_flight != 0 {
            debug!(
                executor = shared.id.get(),
                graphs = *in_flight,
                "Waiting for task graphs before shutdown"
            );
            in_flight = shared
                .idle
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(in_flight);
        info!(executor = shared.id.get(), "Shut down task executor");
    }

    /// Starts one run of `graph`, attaching `event` if given.
    pub(crate) fn run(&self, graph: Arc<CompiledTaskGraph>, event: Option<&TaskGraphEvent>) {
        let shared = &self.shared;
        // Attach before anything is enqueued so the run cannot complete
        // ahead of the event's count.
        let event = event.map(|event| {
            let state = event.state();
            state.inc_wait_count(shared.id);
            state
        });
        *shared.lock_in_flight() += 1;
        graph.run_started();
        debug!(
            executor = shared.id.get(),
            graph = graph.label(),
            tasks = graph.len(),
            event = ?event.as_ref().map(|event| event.label()),
            "Submitting task graph"
        );
        GraphRun::start(Arc::clone(shared), graph, event);
    }
}

impl ExecutorShared {
    fn lock_in_flight(&self) -> MutexGuard<'_, usize> {
        self.graphs_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn graph_finished(&self) {
        self.graphs_completed.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = self.lock_in_flight();
        *in_flight = in_flight
            .checked_sub(1)
            .expect("ExecutorShared::graph_finished");
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{graph::TaskGraph, task::TaskDescriptor};
    use core::num::NonZeroUsize;
    use std::{sync::atomic::AtomicUsize, thread, time::Duration};

    const DESCRIPTOR: TaskDescriptor = TaskDescriptor::new("executor test", "Test");

    fn executor(workers: usize) -> TaskExecutor {
        let config = ExecutorConfig::default()
            .with_worker_count(NonZeroUsize::new(workers).unwrap())
            .with_thread_name("executor-test");
        TaskExecutor::new(&config).unwrap()
    }

    #[test]
    fn reports_worker_count_and_thread_index() {
        let executor = executor(3);
        assert_eq!(executor.worker_count(), 3);
        assert_eq!(executor.current_worker_index(), None);

        let seen = Arc::new(Mutex::new(None));
        let mut graph = TaskGraph::new("thread index");
        {
            let seen = Arc::clone(&seen);
            let shared = Arc::clone(&executor.shared);
            graph.add_task(DESCRIPTOR, move || {
                *seen.lock().unwrap() = shared.pool.current_thread_index();
            });
        }
        let event = TaskGraphEvent::new("thread index");
        graph.submit_on_executor(&executor, Some(&event)).unwrap();
        event.wait();
        assert!(matches!(*seen.lock().unwrap(), Some(idx) if idx < 3));
    }

    #[test]
    fn stats_count_graphs_and_tasks() {
        let executor = executor(2);
        let mut graph = TaskGraph::new("stats");
        let first = graph.add_task(DESCRIPTOR, || {});
        let second = graph.add_task(DESCRIPTOR, || {});
        first.precedes(&mut graph, [second]);
        graph.add_task(DESCRIPTOR, || panic!("expected test panic"));

        let event = TaskGraphEvent::new("stats");
        for _ in 0..2 {
            graph.submit_on_executor(&executor, Some(&event)).unwrap();
            event.wait();
        }
        assert_eq!(
            executor.stats(),
            ExecutorStats {
                graphs_in_flight: 0,
                graphs_completed: 2,
                tasks_executed: 6,
                tasks_panicked: 2,
            }
        );
    }

    #[test]
    fn shutdown_waits_for_in_flight_graphs() {
        let executor = executor(2);
        let finished = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new("slow");
        graph.detach();
        for _ in 0..4 {
            let finished = Arc::clone(&finished);
            graph.add_task(DESCRIPTOR, move || {
                thread::sleep(Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        graph.submit_on_executor(&executor, None).unwrap();
        drop(graph);
        executor.shutdown();
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn default_instance_cannot_be_installed_twice() {
        let default = TaskExecutor::default_instance();
        assert!(default.worker_count() >= 1);
        assert!(core::ptr::eq(default, TaskExecutor::default_instance()));
        assert!(matches!(
            TaskExecutor::init_default(&ExecutorConfig::default()),
            Err(ExecutorError::DefaultAlreadyInitialized)
        ));
    }
}
