//! The background worker context.
//!
//! This module provides:
//! - [`LifecycleController`]: install → waiting → activate transitions and
//!   garbage collection of stale cache generations
//! - [`WorkerRuntime`]: the single-task event loop running the controller
//! - [`WorkerHandle`]: the page's way in, plus the typed messages both sides
//!   exchange
//!
//! Pages and the worker share no state; everything crosses an mpsc command
//! channel, a broadcast event channel, or a oneshot reply.

pub mod lifecycle;
pub mod messages;
pub mod runtime;

pub use lifecycle::{LifecycleController, WorkerGeneration, WorkerState};
pub use messages::{PageMessage, WorkerEvent};
pub use runtime::{WorkerHandle, WorkerRuntime};
