use crate::{
    event::EventState,
    executor::ExecutorShared,
    graph::CompiledTaskGraph,
    sync,
    task::TaskDescriptor,
    types::TaskIndex,
};
use core::any::Any;
use derive_more::{Debug, Deref};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering, fence},
    },
};
use tracing::{debug, error, trace_span};

/// One submission of a compiled graph.
///
/// Holds the counters of this run only, so a retained graph may have
/// several runs in flight. Every queued job holds a reference; the run, and
/// with it a detached graph's compiled form, is freed after its last task.
#[derive(Debug)]
pub(super) struct GraphRun {
    #[debug(skip)]
    executor: Arc<ExecutorShared>,
    graph: Arc<CompiledTaskGraph>,
    /// Per task, predecessors that have not finished yet in this run. Only
    /// read for shared successors; owned successors need no countdown.
    predecessors_left: Box<[PredecessorSlot]>,
    /// Tasks of this run that have not finished yet.
    remaining: AtomicUsize,
    event: Option<sync::Arc<EventState>>,
}

#[derive(Debug, Deref)]
#[repr(align(128))]
struct PredecessorSlot(AtomicU32);

impl GraphRun {
    /// Queues the roots of `graph`.
    pub(super) fn start(
        executor: Arc<ExecutorShared>,
        graph: Arc<CompiledTaskGraph>,
        event: Option<sync::Arc<EventState>>,
    ) {
        let predecessors_left = graph
            .predecessors()
            .iter()
            .map(|&count| PredecessorSlot(AtomicU32::new(count)))
            .collect();
        let run = Arc::new(Self {
            executor,
            remaining: AtomicUsize::new(graph.len()),
            graph,
            predecessors_left,
            event,
        });
        // Roots are laid out most urgent first. Submitted from outside the
        // pool they go through its FIFO injector and start in that order.
        for root in run.graph.roots() {
            run.spawn(root);
        }
    }

    fn spawn(self: &Arc<Self>, idx: TaskIndex) {
        let run = Arc::clone(self);
        self.executor.pool.spawn(move || run.execute_from(idx));
    }

    /// Runs task `idx`, then keeps running one successor it made ready on
    /// this worker while handing the others to the pool.
    fn execute_from(self: Arc<Self>, mut idx: TaskIndex) {
        let mut ready = Vec::new();
        loop {
            self.invoke(idx);

            let layout = self.graph.layout(idx);
            ready.clear();
            ready.extend_from_slice(&layout.owned);
            let num_owned = ready.len();

            // Publish this task's effects to whichever predecessor ends up
            // releasing a shared successor.
            if !layout.shared.is_empty() {
                fence(Ordering::Release);
            }
            for &successor in &layout.shared {
                if self.predecessors_left[successor as usize].fetch_sub(1, Ordering::Relaxed) == 1 {
                    ready.push(successor);
                }
            }
            if ready.len() != num_owned {
                fence(Ordering::Acquire);
            }

            ready.sort_by_key(|&successor| self.graph.task(successor).descriptor.priority);
            let next = ready.first().copied();
            // Jobs spawned from a worker are popped LIFO by that worker:
            // push the least urgent first.
            for &successor in ready.iter().skip(1).rev() {
                self.spawn(successor);
            }

            // Successors are queued (or kept as `next`) before this task
            // counts as finished, so `remaining` cannot reach zero early.
            self.task_finished();
            match next {
                Some(successor) => idx = successor,
                None => return,
            }
        }
    }

    /// Invokes the callable of task `idx`, containing panics.
    fn invoke(&self, idx: TaskIndex) {
        let task = self.graph.task(idx);
        let TaskDescriptor { name, category, .. } = task.descriptor;
        let _span = trace_span!(
            "task",
            graph = self.graph.label(),
            task = name,
            category
        )
        .entered();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (task.job)())) {
            self.executor.tasks_panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                graph = self.graph.label(),
                task = name,
                category,
                panic = panic_message(&*payload),
                "Task panicked, releasing its successors"
            );
        }
        self.executor.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    fn task_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete();
        }
    }

    /// Called once, by the worker finishing the last task of the run.
    fn complete(&self) {
        debug!(graph = self.graph.label(), "Task graph completed");
        // Bookkeeping goes before the event so a woken waiter observes the
        // graph as no longer in flight.
        self.graph.run_finished();
        self.executor.graph_finished();
        if let Some(event) = &self.event {
            event.signal();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static message");

        let payload = panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 42");

        let payload = panic::catch_unwind(|| panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }
}
