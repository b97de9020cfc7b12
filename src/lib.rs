//! Dependency-graph task scheduler for per-frame engine work.
//!
//! This crate runs Directed Acyclic Graphs (DAGs) of closures on a fixed pool
//! of worker threads. It:
//! - Builds graphs incrementally and orders tasks with explicit precedence
//!   edges declared through [`TaskToken`]s.
//! - Compiles each graph once into a topological layout and rejects cycles at
//!   submission time instead of deadlocking.
//! - Distinguishes between successors with a single predecessor (owned) and
//!   those with several (shared), so only the latter pay for an atomic
//!   countdown.
//! - Signals completion through a [`TaskGraphEvent`] that can cover several
//!   submitted graphs.
//!
//! Key modules:
//! - `graph`: the [`TaskGraph`] builder and its compiled form.
//! - `task`: task descriptors and tokens.
//! - `executor`: the worker pool running compiled graphs.
//! - `event`: the countdown event used to wait for submissions.
//! - `config`: executor construction parameters.
//!
//! Quick start (not run with the `loom` feature, whose primitives only work
//! inside `loom::model`):
//!
#![cfg_attr(not(feature = "loom"), doc = "```")]
#![cfg_attr(feature = "loom", doc = "```ignore")]
//! use std::sync::{
//!     Arc,
//!     atomic::{AtomicU32, Ordering},
//! };
//! use task_graph::{TaskDescriptor, TaskGraph, TaskGraphEvent};
//!
//! const STEP: TaskDescriptor = TaskDescriptor::new("step", "Example");
//!
//! let x = Arc::new(AtomicU32::new(0));
//! let mut graph = TaskGraph::new("example");
//! let a = graph.add_task(STEP, {
//!     let x = Arc::clone(&x);
//!     move || x.store(1, Ordering::Relaxed)
//! });
//! let b = graph.add_task(STEP, {
//!     let x = Arc::clone(&x);
//!     move || {
//!         if x.load(Ordering::Relaxed) == 1 {
//!             x.store(2, Ordering::Relaxed);
//!         }
//!     }
//! });
//! b.follows(&mut graph, [a]);
//!
//! let done = TaskGraphEvent::new("example done");
//! graph.submit(Some(&done)).expect("graph is acyclic");
//! done.wait();
//! assert_eq!(x.load(Ordering::Relaxed), 2);
//! ```
//!
//! A task starts only after all its predecessors finished, and observes
//! their effects. Tasks without a path of edges between them run in no
//! particular order, possibly in parallel.

/// Executor construction parameters.
///
/// Exposes [`ExecutorConfig`] and the environment variables it reads.
pub mod config;
/// The countdown event used to wait for submitted graphs.
pub mod event;
/// The fixed worker pool.
///
/// Owns the worker threads, drives compiled graphs to completion and
/// releases successors as their predecessors finish.
pub mod executor;
/// Graph construction, compilation (topological layout, cycle detection) and
/// submission.
pub mod graph;
mod sync;
/// Task descriptors, priorities and tokens.
pub mod task;
/// Identifiers shared across the crate.
pub mod types;

pub use crate::{
    config::ExecutorConfig,
    event::TaskGraphEvent,
    executor::{ExecutorError, ExecutorStats, TaskExecutor},
    graph::{TaskGraph, TaskGraphError},
    task::{TaskDescriptor, TaskPriority, TaskToken},
};
