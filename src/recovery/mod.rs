//! Crash recovery: startup repair inside the daemon, and the external supervisor.

pub mod startup;
pub mod supervisor;

pub use startup::{CrashRecovery, FlushOutcome, RecoveryReport};
pub use supervisor::{
    CheckOutcome, CrashRecord, DaemonControl, Observation, PolicyRule, ProcessControl, Remediation,
    Supervisor, decide, default_policy, write_pid,
};
