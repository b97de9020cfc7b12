use crate::{
    sync::{Arc, AtomicU64, AtomicUsize, Condvar, Mutex, Ordering, lock},
    types::ExecutorId,
};
use derive_more::Debug;

/// Countdown event used to block until submitted task graphs finish.
///
/// Every submission that attaches the event increments its pending count
/// before the graph is enqueued, and the worker completing the graph
/// decrements it. The event is signaled while the count is zero, so one
/// event may cover several concurrently submitted graphs.
///
/// An event must not be attached to a new submission after it was signaled
/// but before every thread blocked in [`wait`](Self::wait) has returned.
/// Doing so panics.
#[must_use]
#[derive(Debug)]
pub struct TaskGraphEvent {
    inner: Arc<EventState>,
}

#[derive(Debug)]
pub(crate) struct EventState {
    label: &'static str,
    /// Submissions attached and not yet completed.
    pending: AtomicUsize,
    /// Executor the pending submissions run on, `0` when none.
    executor: AtomicU64,
    /// Threads blocked in `wait`.
    #[debug(skip)]
    waiters: Mutex<usize>,
    #[debug(skip)]
    signaled: Condvar,
}

impl TaskGraphEvent {
    /// Creates a signaled event.
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(EventState {
                label,
                pending: AtomicUsize::new(0),
                executor: AtomicU64::new(0),
                waiters: Mutex::new(0),
                signaled: Condvar::new(),
            }),
        }
    }

    /// Debug label given at construction.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    /// Whether no attached submission is outstanding.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire) == 0
    }

    /// Blocks the calling thread until every attached submission completed.
    ///
    /// Effects of all tasks of those submissions are visible to the caller
    /// once this returns. Must not be called from a worker of the executor
    /// running the attached graphs, as that worker could be the one needed
    /// to finish them.
    pub fn wait(&self) {
        let state = &*self.inner;
        let mut waiters = lock(&state.waiters);
        *waiters += 1;
        while state.pending.load(Ordering::Acquire) != 0 {
            waiters = state
                .signaled
                .wait(waiters)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *waiters -= 1;
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns whether the event was signaled. Timing out has no effect on
    /// the attached graphs, which keep running.
    #[cfg(not(feature = "loom"))]
    #[must_use]
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let state = &*self.inner;
        let deadline = std::time::Instant::now() + timeout;
        let mut waiters = lock(&state.waiters);
        *waiters += 1;
        let signaled = loop {
            if state.pending.load(Ordering::Acquire) == 0 {
                break true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                break false;
            }
            waiters = state
                .signaled
                .wait_timeout(waiters, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        };
        *waiters -= 1;
        signaled
    }

    pub(crate) fn state(&self) -> Arc<EventState> {
        Arc::clone(&self.inner)
    }
}

impl EventState {
    /// Registers one more submission running on `executor`.
    ///
    /// Called before the submission is enqueued, so the graph cannot finish
    /// before the count accounts for it.
    pub(crate) fn inc_wait_count(&self, executor: ExecutorId) {
        let waiters = lock(&self.waiters);
        assert!(
            !(*waiters > 0 && self.pending.load(Ordering::Acquire) == 0),
            "TaskGraphEvent `{}` was reattached before its previous wait returned",
            self.label
        );
        if self.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            self.executor.store(executor.get(), Ordering::Relaxed);
        } else {
            debug_assert_eq!(
                self.executor.load(Ordering::Relaxed),
                executor.get(),
                "TaskGraphEvent `{}` is attached to graphs running on different executors",
                self.label
            );
        }
        drop(waiters);
    }

    /// Marks one attached submission as completed, waking waiters when it
    /// was the last one.
    pub(crate) fn signal(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(
            previous, 0,
            "TaskGraphEvent `{}` signaled more often than attached",
            self.label
        );
        if previous == 1 {
            // Taking the lock orders this notification after any waiter that
            // observed a non-zero count and is about to block.
            let _waiters = lock(&self.waiters);
            self.signaled.notify_all();
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        self.label
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn executor_id() -> ExecutorId {
        ExecutorId::next()
    }

    #[test]
    fn fresh_event_is_signaled() {
        let event = TaskGraphEvent::new("fresh");
        assert!(event.is_signaled());
        event.wait();
        assert!(event.wait_timeout(Duration::ZERO));
        assert_eq!(event.label(), "fresh");
    }

    #[test]
    fn signals_after_last_attached_submission() {
        let event = TaskGraphEvent::new("two graphs");
        let id = executor_id();
        let state = event.state();
        state.inc_wait_count(id);
        state.inc_wait_count(id);
        assert!(!event.is_signaled());

        state.signal();
        assert!(!event.is_signaled());
        assert!(!event.wait_timeout(Duration::from_millis(10)));

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            state.signal();
        });
        event.wait();
        assert!(event.is_signaled());
        producer.join().unwrap();
    }

    #[test]
    fn can_be_reused_after_wait_returned() {
        let event = TaskGraphEvent::new("per frame");
        let id = executor_id();
        for _ in 0..3 {
            let state = event.state();
            state.inc_wait_count(id);
            let producer = thread::spawn(move || state.signal());
            event.wait();
            producer.join().unwrap();
        }
        assert!(event.is_signaled());
    }

    #[test]
    #[should_panic(expected = "signaled more often than attached")]
    fn unbalanced_signal_panics() {
        TaskGraphEvent::new("unbalanced").state().signal();
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::thread;

    #[test]
    fn loom_waiter_observes_every_producer() {
        loom::model(|| {
            let event = TaskGraphEvent::new("loom");
            let id = ExecutorId::next();
            let done = Arc::new(AtomicUsize::new(0));
            let producers: Vec<_> = (0..2)
                .map(|_| {
                    let state = event.state();
                    state.inc_wait_count(id);
                    let done = Arc::clone(&done);
                    thread::spawn(move || {
                        done.fetch_add(1, Ordering::Relaxed);
                        state.signal();
                    })
                })
                .collect();
            event.wait();
            assert!(event.is_signaled());
            assert_eq!(done.load(Ordering::Relaxed), 2);
            for producer in producers {
                producer.join().unwrap();
            }
        });
    }

    #[test]
    fn loom_signal_before_wait_is_not_lost() {
        loom::model(|| {
            let event = TaskGraphEvent::new("loom early");
            let state = event.state();
            state.inc_wait_count(ExecutorId::next());
            let producer = thread::spawn(move || state.signal());
            producer.join().unwrap();
            event.wait();
            assert!(event.is_signaled());
        });
    }
}
