use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Position of a task within its graph.
///
/// Builder indices follow insertion order. Compiled graphs re-lay tasks in
/// topological order, so a compiled index is not a builder index.
pub type TaskIndex = u32;

/// Process-unique identifier of a [`TaskGraph`](crate::graph::TaskGraph).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GraphId(u64);

/// Process-unique identifier of a
/// [`TaskExecutor`](crate::executor::TaskExecutor).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExecutorId(u64);

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

impl GraphId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl ExecutorId {
    pub(crate) fn next() -> Self {
        Self(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn get(self) -> u64 {
        self.0
    }
}

pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
