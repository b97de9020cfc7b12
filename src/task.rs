use crate::{
    graph::TaskGraph,
    types::{GraphId, TaskIndex},
};
use derive_more::Debug;

/// Dispatch hint for tasks that become ready at the same time.
///
/// Higher priority tasks are dispatched first. Priority never lets a task
/// start before its predecessors finished.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Work on the critical path of a frame.
    Critical,
    /// Work that should run ahead of regular tasks.
    High,
    /// Regular work.
    #[default]
    Medium,
    /// Work that may lag behind everything else.
    Low,
}

/// Tracking metadata attached to every task.
///
/// Name and category are not interpreted by the scheduler; they are recorded
/// on the `tracing` span each task runs in.
#[must_use]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskDescriptor {
    /// Task name.
    pub name: &'static str,
    /// Subsystem the task belongs to, e.g. `"Graphics"` or `"Physics"`.
    pub category: &'static str,
    /// Dispatch hint.
    pub priority: TaskPriority,
}

impl TaskDescriptor {
    /// Descriptor with [`TaskPriority::Medium`].
    pub const fn new(name: &'static str, category: &'static str) -> Self {
        Self {
            name,
            category,
            priority: TaskPriority::Medium,
        }
    }

    /// Returns the descriptor with `priority`.
    pub const fn with_priority(self, priority: TaskPriority) -> Self {
        Self { priority, ..self }
    }
}

/// Type-erased task callable.
///
/// `Fn` rather than `FnMut`: a retained graph may have several runs in
/// flight, each of which may invoke the same callable.
pub(crate) type TaskFn = Box<dyn Fn() + Send + Sync>;

/// A single unit of work: a callable plus its descriptor.
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) descriptor: TaskDescriptor,
    #[debug(skip)]
    pub(crate) job: TaskFn,
}

impl Task {
    pub(crate) fn new(descriptor: TaskDescriptor, job: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            descriptor,
            job: Box::new(job),
        }
    }
}

/// Handle to a task of a [`TaskGraph`] that has not been submitted yet.
///
/// Only used to declare precedence edges. A token becomes invalid once its
/// graph is submitted or reset; using it afterwards panics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskToken {
    pub(crate) graph: GraphId,
    pub(crate) generation: u32,
    pub(crate) index: TaskIndex,
}

impl TaskToken {
    /// Position of the task in its graph, in insertion order.
    #[must_use]
    pub fn index(&self) -> TaskIndex {
        self.index
    }

    /// Declares that this task finishes before each of `successors` starts.
    ///
    /// # Panics
    /// If any token does not belong to `graph`, or `graph` was submitted.
    pub fn precedes(
        self,
        graph: &mut TaskGraph,
        successors: impl IntoIterator<Item = TaskToken>,
    ) -> Self {
        for successor in successors {
            graph.link(self, successor);
        }
        self
    }

    /// Declares that each of `predecessors` finishes before this task starts.
    ///
    /// # Panics
    /// If any token does not belong to `graph`, or `graph` was submitted.
    pub fn follows(
        self,
        graph: &mut TaskGraph,
        predecessors: impl IntoIterator<Item = TaskToken>,
    ) -> Self {
        for predecessor in predecessors {
            graph.link(predecessor, self);
        }
        self
    }
}
