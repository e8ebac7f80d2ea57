//! Health monitor — periodic detection of stuck, looping or failing sessions.

pub mod heuristics;
pub mod monitor;

pub use heuristics::{Assessment, Issue, Severity, assess, fingerprint};
pub use monitor::{CheckReport, HealthMonitor, WatchState, spawn_health_monitor};
