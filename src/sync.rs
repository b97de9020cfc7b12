//! Synchronization primitives behind [`TaskGraphEvent`](crate::event::TaskGraphEvent).
//!
//! With the `loom` feature the event is built on `loom`'s model-checked
//! primitives so its signal/wait protocol can be explored exhaustively.

#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    };
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use std::sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    };
}

pub(crate) use imp::*;

/// Locks `mutex`, ignoring poisoning.
///
/// The protected data is a plain counter that a panicking holder cannot
/// leave half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
