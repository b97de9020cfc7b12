mod compile;

pub(crate) use crate::graph::compile::CompiledTaskGraph;
use crate::{
    event::TaskGraphEvent,
    executor::TaskExecutor,
    task::{Task, TaskDescriptor, TaskToken},
    types::{GraphId, IndexMap, IndexSet, TaskIndex},
};
use derive_more::Debug;
use std::{borrow::Cow, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// Error returned when submitting an invalid task graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskGraphError {
    /// The precedence edges contain cycle(s), so some tasks could never start.
    #[error("task graph `{graph}` contains cycle(s) through tasks {tasks:?}")]
    Cycle {
        /// Label of the rejected graph.
        graph: String,
        /// Names of the tasks that could not be ordered.
        tasks: Vec<&'static str>,
    },
}

/// Builder of a DAG of tasks with explicit precedence edges.
///
/// Tasks are added with [`add_task`](Self::add_task), ordered with
/// [`TaskToken::precedes`]/[`TaskToken::follows`] and run with
/// [`submit`](Self::submit). The first submission compiles the graph and
/// moves the callables into the compiled form.
///
/// A graph is retained by default: the compiled form is cached, and the
/// graph can be submitted again (for instance once per frame), including
/// while earlier runs are still in flight. A [`detach`](Self::detach)ed graph
/// runs once and frees its compiled form when that run completes; the
/// builder may be dropped right after submission.
#[must_use]
#[derive(Debug)]
pub struct TaskGraph {
    label: Cow<'static, str>,
    id: GraphId,
    /// Incremented on reset to invalidate previously issued tokens.
    generation: u32,
    tasks: Vec<Task>,
    /// Tasks added, including those moved into the compiled form.
    len: usize,
    /// Task index -> indices of the tasks that follow it.
    links: IndexMap<TaskIndex, IndexSet<TaskIndex>>,
    edge_count: usize,
    retained: bool,
    submitted: bool,
    #[debug(skip)]
    compiled: Option<Arc<CompiledTaskGraph>>,
}

impl TaskGraph {
    /// Creates an empty, retained graph.
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            id: GraphId::next(),
            generation: 0,
            tasks: Vec::new(),
            len: 0,
            links: IndexMap::default(),
            edge_count: 0,
            retained: true,
            submitted: false,
            compiled: None,
        }
    }

    /// Label given at construction.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Appends a task.
    ///
    /// # Panics
    /// If the graph was submitted and not reset since.
    pub fn add_task(
        &mut self,
        descriptor: TaskDescriptor,
        job: impl Fn() + Send + Sync + 'static,
    ) -> TaskToken {
        self.assert_mutable("add a task to");
        let index = self
            .len
            .try_into()
            .expect("TaskGraph::add_task: too many tasks");
        self.tasks.push(Task::new(descriptor, job));
        self.len += 1;
        TaskToken {
            graph: self.id,
            generation: self.generation,
            index,
        }
    }

    /// Appends several tasks sharing one descriptor.
    ///
    /// Closures built by one expression share a type, so
    /// `core::array::from_fn(|i| move || work(i))` is a convenient source.
    ///
    /// # Panics
    /// If the graph was submitted and not reset since.
    pub fn add_tasks<F, const N: usize>(
        &mut self,
        descriptor: TaskDescriptor,
        jobs: [F; N],
    ) -> [TaskToken; N]
    where
        F: Fn() + Send + Sync + 'static,
    {
        jobs.map(|job| self.add_task(descriptor, job))
    }

    /// Declares that `from` finishes before `to` starts.
    ///
    /// Repeated edges are recorded once.
    ///
    /// # Panics
    /// If either token was issued by another graph or before the last reset,
    /// or if the graph was submitted.
    pub fn link(&mut self, from: TaskToken, to: TaskToken) {
        self.assert_mutable("add an edge to");
        self.assert_own_token(from);
        self.assert_own_token(to);
        if self.links.entry(from.index).or_default().insert(to.index) {
            self.edge_count += 1;
        }
    }

    /// Whether no task was added since construction or the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks, including those moved into the compiled form.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of distinct precedence edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Whether the compiled form is kept for resubmission.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.retained
    }

    /// Whether the graph was submitted since construction or the last reset.
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Whether a run of this graph has not completed yet.
    ///
    /// Always `false` for a detached graph, whose runs are not tracked by
    /// the builder.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.compiled
            .as_ref()
            .is_some_and(|compiled| compiled.in_flight() != 0)
    }

    /// Returns the graph to an empty state, invalidating issued tokens.
    ///
    /// # Panics
    /// If a run of the graph is in flight.
    pub fn reset(&mut self) {
        assert!(
            !self.is_in_flight(),
            "Cannot reset task graph `{}` while it is in flight",
            self.label
        );
        self.tasks.clear();
        self.len = 0;
        self.links.clear();
        self.edge_count = 0;
        self.compiled = None;
        self.retained = true;
        self.submitted = false;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Frees the compiled form once the next run completes instead of
    /// caching it. The graph cannot be resubmitted until reset.
    ///
    /// # Panics
    /// If the graph was already submitted.
    pub fn detach(&mut self) {
        assert!(
            !self.submitted,
            "Cannot detach task graph `{}` after it was submitted",
            self.label
        );
        self.retained = false;
    }

    /// Submits the graph to the default executor.
    ///
    /// See [`submit_on_executor`](Self::submit_on_executor).
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn submit(&mut self, event: Option<&TaskGraphEvent>) -> Result<(), TaskGraphError> {
        self.submit_on_executor(TaskExecutor::default_instance(), event)
    }

    /// Submits the graph to `executor`.
    ///
    /// Compiles the graph on first submission. If `event` is given, it stays
    /// unsignaled until this run completes. Submitting an empty graph does
    /// nothing: `event` is left untouched and tasks can still be added.
    ///
    /// # Errors
    /// If the graph contains cycle(s). The graph is left unchanged and can
    /// be reset.
    ///
    /// # Panics
    /// If a detached graph is submitted a second time.
    pub fn submit_on_executor(
        &mut self,
        executor: &TaskExecutor,
        event: Option<&TaskGraphEvent>,
    ) -> Result<(), TaskGraphError> {
        if self.is_empty() {
            debug!(graph = %self.label, "Skipping submission of empty task graph");
            return Ok(());
        }
        assert!(
            self.retained || !self.submitted,
            "Detached task graph `{}` cannot be submitted again before reset",
            self.label
        );
        let compiled = match &self.compiled {
            Some(compiled) => Arc::clone(compiled),
            None => {
                let compiled = CompiledTaskGraph::compile(&self.label, &mut self.tasks, &self.links)
                    .inspect_err(|err| debug!(%err, "Rejected task graph submission"))?;
                let compiled = Arc::new(compiled);
                if self.retained {
                    self.compiled = Some(Arc::clone(&compiled));
                }
                compiled
            }
        };
        self.submitted = true;
        executor.run(compiled, event);
        Ok(())
    }

    fn assert_mutable(&self, action: &str) {
        assert!(
            !self.submitted,
            "Cannot {action} task graph `{}` after it was submitted; reset it first",
            self.label
        );
    }

    fn assert_own_token(&self, token: TaskToken) {
        assert!(
            token.graph == self.id && token.generation == self.generation,
            "Task token {token:?} does not belong to task graph `{}`",
            self.label
        );
        debug_assert!((token.index as usize) < self.len);
    }
}
