//! The page context: what the UI layer talks to.
//!
//! [`UpdateController`] exposes the check/apply/dismiss commands and an
//! observable [`UpdateStatus`]; [`PollScheduler`] decides when a periodic
//! check is due.

pub mod controller;
pub mod scheduler;

pub use controller::{Reloader, UpdateController, UpdateStatus};
pub use scheduler::PollScheduler;
