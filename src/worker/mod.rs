//! Worker system — one cooperative loop per project key.
//!
//! - `worker` — the loop that drives a key's jobs through the executor
//! - `scheduler` — starts loops on demand and retires them when idle

pub mod scheduler;
pub mod worker;

pub use scheduler::{Scheduler, spawn_queue_sweeper};
pub use worker::{FOLLOWUP_SENDER, Outcome, WorkerDeps, WorkerLoop};
