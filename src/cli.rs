//! Command-line interface.

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::queue::Priority;

#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(author, version, about = "Per-project job queue and supervisor for coding agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum PriorityArg {
    Low,
    #[default]
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon: workers, health monitor and queue sweeper
    Run,

    /// Show queue depth per project and active sessions
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Requeue every running job whose worker stopped heartbeating
    FlushStuck,

    /// Requeue one running job, unless its worker is still alive
    FlushJob {
        /// Job ID
        id: Uuid,
    },

    /// Queue a new job
    Submit {
        /// Project key (one worker per key)
        project: String,

        /// Session ID
        session: String,

        /// Message handed to the agent
        text: String,

        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,

        /// Use the long-running timeout
        #[arg(long)]
        long_running: bool,

        /// Work item slug; runs in its own worktree
        #[arg(long)]
        slug: Option<String>,

        #[arg(long, default_value = "operator")]
        sender: String,
    },

    /// Send a message to a session: steers it when running, queues a job otherwise
    Steer {
        project: String,

        session: String,

        text: String,

        #[arg(long, default_value = "operator")]
        sender: String,

        /// Stop the running session instead of redirecting it
        #[arg(long)]
        abort: bool,
    },

    /// Manage work-item worktrees
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },

    /// Watch the daemon from outside and restart or escalate when it fails
    Supervise {
        /// Run a single check and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceAction {
    /// List worktrees
    List,

    /// Remove worktrees left behind by crashed runs
    Prune,

    /// Remove one worktree
    Remove {
        slug: String,

        /// Also delete the work branch
        #[arg(long)]
        delete_branch: bool,
    },
}
