//! agent-relay — per-project job queue, steering and self-healing for coding agents.

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod git;
pub mod health;
pub mod intake;
pub mod notify;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod store;
pub mod worker;
pub mod workspace;

pub use error::{Error, Result};
