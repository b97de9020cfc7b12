use crate::{
    graph::TaskGraphError,
    task::Task,
    types::{IndexMap, IndexSet, TaskIndex},
};
use core::{mem, ops::Range};
use derive_more::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use unzip3::Unzip3;

/// Execution-ready form of a [`TaskGraph`](crate::graph::TaskGraph).
///
/// Tasks are laid out in topological order with all roots first, so the
/// roots of a run are `0..num_roots`. Successors are split into:
/// - `owned`: successors with this task as their only predecessor. They are
///   ready as soon as this task finishes, without synchronization.
/// - `shared`: successors with several predecessors. Each run keeps an
///   atomic countdown per such successor.
///
/// Everything but the in-flight counter is immutable after compilation and
/// shared by all runs of the graph.
#[must_use]
#[derive(Debug)]
pub(crate) struct CompiledTaskGraph {
    label: String,
    tasks: Vec<Task>,
    layouts: Vec<TaskLayout>,
    /// In-degree of every task.
    predecessors: Vec<u32>,
    num_roots: TaskIndex,
    /// Runs submitted and not yet completed.
    in_flight: AtomicUsize,
}

#[must_use]
#[derive(Debug)]
pub(crate) struct TaskLayout {
    pub(crate) owned: Box<[TaskIndex]>,
    pub(crate) shared: Box<[TaskIndex]>,
}

impl CompiledTaskGraph {
    /// Compiles `tasks` ordered by `links` (task -> successors, builder
    /// indices).
    ///
    /// On success the tasks are moved out of `tasks`. On error `tasks` is
    /// left untouched.
    ///
    /// # Panics
    /// In case of internal invariant violations. Impossible if there are no
    /// bugs in the code.
    ///
    /// # Errors
    /// In case if the graph contains cycle(s).
    pub(crate) fn compile(
        label: &str,
        tasks: &mut Vec<Task>,
        links: &IndexMap<TaskIndex, IndexSet<TaskIndex>>,
    ) -> Result<Self, TaskGraphError> {
        // Example:
        //
        //   A     B
        //    \   /
        //      C
        //      |
        //      D
        //
        // - Roots: A, B => indices 0 and 1 in the compiled layout.
        // - A->C and B->C are shared edges: C waits on an atomic countdown
        //   from 2.
        // - C->D is an owned edge: D is ready as soon as C finishes.
        let len = tasks.len();

        // Phase 1: in-degree of every task.
        let mut predecessors = vec![0u32; len];
        for successors in links.values() {
            for &successor in successors {
                let count = &mut predecessors[successor as usize];
                *count = count.checked_add(1).expect("CompiledTaskGraph::compile: [1]");
            }
        }

        // Phase 2: seed the order with roots, most urgent first. The sort is
        // stable, so roots of equal priority keep insertion order.
        let mut order: Vec<TaskIndex> = (0..len)
            .filter(|&idx| predecessors[idx] == 0)
            .map(|idx| idx.try_into().expect("CompiledTaskGraph::compile: [2]"))
            .collect();
        order.sort_by_key(|&idx| tasks[idx as usize].descriptor.priority);
        let num_roots = order.len().try_into().expect("CompiledTaskGraph::compile: [3]");

        // Phase 3: Kahn's algorithm. A task is appended once its last
        // predecessor was placed. Tasks on or behind a cycle never are.
        let mut unresolved = predecessors.clone();
        let mut cursor = 0;
        while cursor < order.len() {
            let idx = order[cursor];
            cursor += 1;
            let Some(successors) = links.get(&idx) else {
                continue;
            };
            for &successor in successors {
                let left = &mut unresolved[successor as usize];
                *left = left.checked_sub(1).expect("CompiledTaskGraph::compile: [4]");
                if *left == 0 {
                    order.push(successor);
                }
            }
        }

        if order.len() != len {
            return Err(TaskGraphError::Cycle {
                graph: label.to_owned(),
                tasks: unresolved
                    .iter()
                    .zip(tasks.iter())
                    .filter(|&(&left, _)| left != 0)
                    .map(|(_, task)| task.descriptor.name)
                    .collect(),
            });
        }

        // Phase 4: builder index -> compiled index.
        let mut position: Vec<TaskIndex> = vec![0; len];
        for (compiled_idx, &idx) in order.iter().enumerate() {
            position[idx as usize] = compiled_idx
                .try_into()
                .expect("CompiledTaskGraph::compile: [5]");
        }

        // Phase 5: materialize tasks and layouts in topological order.
        let mut slots: Vec<Option<Task>> = mem::take(tasks).into_iter().map(Some).collect();
        let (tasks, layouts, compiled_predecessors): (Vec<_>, Vec<_>, Vec<_>) = order
            .iter()
            .map(|&idx| {
                let task = slots[idx as usize]
                    .take()
                    .expect("CompiledTaskGraph::compile: [6]");
                let mut owned = vec![];
                let mut shared = vec![];
                for &successor in links.get(&idx).into_iter().flatten() {
                    let compiled_successor = position[successor as usize];
                    assert!(
                        compiled_successor > position[idx as usize],
                        "CompiledTaskGraph::compile: [7]"
                    );
                    match predecessors[successor as usize] {
                        0 => unreachable!("CompiledTaskGraph::compile: [8]"),
                        1 => owned.push(compiled_successor),
                        _ => shared.push(compiled_successor),
                    }
                }
                // Sort successors' indexes to achieve better cache locality.
                owned.sort_unstable();
                shared.sort_unstable();
                let layout = TaskLayout {
                    owned: owned.into_boxed_slice(),
                    shared: shared.into_boxed_slice(),
                };
                (task, layout, predecessors[idx as usize])
            })
            .unzip3();
        assert!(
            slots.iter().all(Option::is_none),
            "CompiledTaskGraph::compile: [9]"
        );

        let result = Self {
            label: label.to_owned(),
            tasks,
            layouts,
            predecessors: compiled_predecessors,
            num_roots,
            in_flight: AtomicUsize::new(0),
        };
        assert_eq!(result.tasks.len(), len, "CompiledTaskGraph::compile: [10]");
        assert_eq!(result.layouts.len(), len, "CompiledTaskGraph::compile: [11]");
        if len != 0 {
            assert_ne!(result.num_roots, 0, "CompiledTaskGraph::compile: [12]");
        }
        Ok(result)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn roots(&self) -> Range<TaskIndex> {
        0..self.num_roots
    }

    pub(crate) fn task(&self, idx: TaskIndex) -> &Task {
        &self.tasks[idx as usize]
    }

    pub(crate) fn layout(&self, idx: TaskIndex) -> &TaskLayout {
        &self.layouts[idx as usize]
    }

    /// In-degree of every task, by compiled index.
    pub(crate) fn predecessors(&self) -> &[u32] {
        &self.predecessors
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn run_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn run_finished(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(previous, 0, "CompiledTaskGraph::run_finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskDescriptor, TaskPriority};

    fn tasks(names: &[&'static str]) -> Vec<Task> {
        names
            .iter()
            .map(|&name| Task::new(TaskDescriptor::new(name, "Test"), || {}))
            .collect()
    }

    fn links(edges: &[(TaskIndex, TaskIndex)]) -> IndexMap<TaskIndex, IndexSet<TaskIndex>> {
        let mut links = IndexMap::<_, IndexSet<_>>::default();
        for &(from, to) in edges {
            links.entry(from).or_default().insert(to);
        }
        links
    }

    fn names(graph: &CompiledTaskGraph) -> Vec<&'static str> {
        (0..graph.len() as TaskIndex)
            .map(|idx| graph.task(idx).descriptor.name)
            .collect()
    }

    #[test]
    fn diamond_is_laid_out_topologically() {
        // Inserted out of order: D, B, A, C with A -> {B, C} -> D.
        let mut source = tasks(&["D", "B", "A", "C"]);
        let edges = links(&[(2, 1), (2, 3), (1, 0), (3, 0)]);
        let graph = CompiledTaskGraph::compile("diamond", &mut source, &edges).unwrap();
        assert!(source.is_empty());

        assert_eq!(names(&graph), ["A", "B", "C", "D"]);
        assert_eq!(graph.roots(), 0..1);
        assert_eq!(graph.predecessors(), [0, 1, 1, 2]);
        assert_eq!(&*graph.layout(0).owned, [1, 2]);
        assert!(graph.layout(0).shared.is_empty());
        assert_eq!(&*graph.layout(1).shared, [3]);
        assert_eq!(&*graph.layout(2).shared, [3]);
        assert!(graph.layout(3).owned.is_empty() && graph.layout(3).shared.is_empty());
    }

    #[test]
    fn independent_tasks_are_all_roots() {
        let mut source = tasks(&["a", "b", "c"]);
        let graph = CompiledTaskGraph::compile("flat", &mut source, &links(&[])).unwrap();
        assert_eq!(graph.roots(), 0..3);
        assert_eq!(names(&graph), ["a", "b", "c"]);
    }

    #[test]
    fn roots_are_ordered_by_priority() {
        let mut source = vec![
            Task::new(TaskDescriptor::new("low", "Test").with_priority(TaskPriority::Low), || {}),
            Task::new(TaskDescriptor::new("medium", "Test"), || {}),
            Task::new(
                TaskDescriptor::new("critical", "Test").with_priority(TaskPriority::Critical),
                || {},
            ),
            Task::new(TaskDescriptor::new("medium 2", "Test"), || {}),
        ];
        let graph = CompiledTaskGraph::compile("priorities", &mut source, &links(&[])).unwrap();
        assert_eq!(names(&graph), ["critical", "medium", "medium 2", "low"]);
    }

    #[test]
    fn two_task_cycle_is_rejected() {
        let mut source = tasks(&["A", "B"]);
        let err = CompiledTaskGraph::compile("cycle", &mut source, &links(&[(0, 1), (1, 0)]))
            .unwrap_err();
        assert_eq!(
            err,
            TaskGraphError::Cycle {
                graph: "cycle".to_owned(),
                tasks: vec!["A", "B"],
            }
        );
        assert_eq!(source.len(), 2, "tasks must survive a rejected compilation");
    }

    #[test]
    fn self_edge_is_rejected() {
        let mut source = tasks(&["root", "loop"]);
        let err =
            CompiledTaskGraph::compile("self", &mut source, &links(&[(0, 1), (1, 1)])).unwrap_err();
        assert!(matches!(err, TaskGraphError::Cycle { tasks, .. } if tasks == ["loop"]));
    }

    #[test]
    fn cycle_behind_a_root_is_rejected() {
        //   R -> X -> Y -> Z
        //        ^---------'
        let mut source = tasks(&["R", "X", "Y", "Z", "free"]);
        let err = CompiledTaskGraph::compile(
            "downstream",
            &mut source,
            &links(&[(0, 1), (1, 2), (2, 3), (3, 1)]),
        )
        .unwrap_err();
        assert!(matches!(err, TaskGraphError::Cycle { tasks, .. } if tasks == ["X", "Y", "Z"]));
    }

    #[test]
    fn empty_graph_compiles() {
        let mut source = vec![];
        let graph = CompiledTaskGraph::compile("empty", &mut source, &links(&[])).unwrap();
        assert_eq!(graph.len(), 0);
        assert_eq!(graph.roots(), 0..0);
        assert_eq!(graph.label(), "empty");
    }
}
