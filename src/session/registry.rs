//! Session registry — in-process handles to live executions.
//!
//! Not durable. It starts empty on every boot and only answers "is this
//! session executing in this process right now, and how do I poke it". The
//! job store stays the source of truth.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Request to stop the current execution of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRequest {
    pub reason: String,
}

struct Entry {
    job_id: Uuid,
    project_key: String,
    wake: Arc<Notify>,
    interrupt_tx: mpsc::UnboundedSender<InterruptRequest>,
}

/// Snapshot of one registered execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    pub session_id: String,
    pub job_id: Uuid,
    pub project_key: String,
}

/// Map from session id to the live execution driving it.
#[derive(Default)]
pub struct SessionRegistry {
    // Held only for map edits and never across an await, so the
    // registration guard can deregister from `Drop`.
    entries: RwLock<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the execution of `job_id` under `session_id`.
    ///
    /// The returned guard removes the entry when dropped, whichever way the
    /// owning worker iteration ends.
    pub fn register(
        self: &Arc<Self>,
        session_id: &str,
        job_id: Uuid,
        project_key: &str,
    ) -> Registration {
        let wake = Arc::new(Notify::new());
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let previous = self.write_entries().insert(
            session_id.to_string(),
            Entry {
                job_id,
                project_key: project_key.to_string(),
                wake: wake.clone(),
                interrupt_tx,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(
                session_id,
                previous_job = %previous.job_id,
                job_id = %job_id,
                "Replacing live registry entry"
            );
        }
        tracing::debug!(session_id, job_id = %job_id, "Session registered");

        Registration {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            job_id,
            wake,
            interrupts: interrupt_rx,
        }
    }

    /// Nudge the worker driving `session_id` to poll its steering mailbox now.
    /// Returns `false` when no live execution owns the session.
    pub fn wake(&self, session_id: &str) -> bool {
        match self.read_entries().get(session_id) {
            Some(entry) => {
                entry.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Ask the live execution of `session_id` to stop.
    pub fn interrupt(&self, session_id: &str, reason: impl Into<String>) -> bool {
        match self.read_entries().get(session_id) {
            Some(entry) => entry
                .interrupt_tx
                .send(InterruptRequest {
                    reason: reason.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read_entries().contains_key(session_id)
    }

    pub fn job_for(&self, session_id: &str) -> Option<Uuid> {
        self.read_entries().get(session_id).map(|e| e.job_id)
    }

    pub fn live_sessions(&self) -> Vec<LiveSession> {
        let mut sessions: Vec<LiveSession> = self
            .read_entries()
            .iter()
            .map(|(session_id, entry)| LiveSession {
                session_id: session_id.clone(),
                job_id: entry.job_id,
                project_key: entry.project_key.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deregister(&self, session_id: &str, job_id: Uuid) {
        let mut entries = self.write_entries();
        // A newer registration for the same session is left alone.
        if entries.get(session_id).is_some_and(|e| e.job_id == job_id) {
            entries.remove(session_id);
            tracing::debug!(session_id, job_id = %job_id, "Session deregistered");
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ownership of one registry entry, held by the worker driving the execution.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    session_id: String,
    job_id: Uuid,
    wake: Arc<Notify>,
    interrupts: mpsc::UnboundedReceiver<InterruptRequest>,
}

impl Registration {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Resolves when someone calls [`SessionRegistry::wake`] for this session.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Shared handle to the wake-up signal, for racing it against
    /// [`Registration::next_interrupt`] in one `select!`.
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Next interrupt request. Pending forever once the sender side is gone.
    pub async fn next_interrupt(&mut self) -> Option<InterruptRequest> {
        self.interrupts.recv().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.session_id, self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn registration_is_removed_on_drop() {
        let registry = Arc::new(SessionRegistry::new());
        let job_id = Uuid::new_v4();
        {
            let _reg = registry.register("s1", job_id, "proj");
            assert!(registry.contains("s1"));
            assert_eq!(registry.job_for("s1"), Some(job_id));
        }
        assert!(!registry.contains("s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_guard_does_not_remove_newer_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let old = registry.register("s1", Uuid::new_v4(), "proj");
        let newer_job = Uuid::new_v4();
        let _newer = registry.register("s1", newer_job, "proj");
        drop(old);
        assert_eq!(registry.job_for("s1"), Some(newer_job));
    }

    #[test]
    fn wake_and_interrupt_require_live_entry() {
        let registry = Arc::new(SessionRegistry::new());
        assert!(!registry.wake("ghost"));
        assert!(!registry.interrupt("ghost", "test"));
    }

    #[tokio::test]
    async fn interrupt_reaches_owner() {
        let registry = Arc::new(SessionRegistry::new());
        let mut reg = registry.register("s1", Uuid::new_v4(), "proj");
        assert!(registry.interrupt("s1", "watchdog"));
        let req = reg.next_interrupt().await.unwrap();
        assert_eq!(req.reason, "watchdog");
    }

    #[tokio::test]
    async fn wake_notifies_owner() {
        let registry = Arc::new(SessionRegistry::new());
        let reg = registry.register("s1", Uuid::new_v4(), "proj");
        assert!(registry.wake("s1"));
        // notify_one stores a permit, so a later await still completes
        tokio::time::timeout(Duration::from_secs(1), reg.woken())
            .await
            .unwrap();
    }

    #[test]
    fn live_sessions_snapshot() {
        let registry = Arc::new(SessionRegistry::new());
        let _a = registry.register("b", Uuid::new_v4(), "k2");
        let _b = registry.register("a", Uuid::new_v4(), "k1");
        let live = registry.live_sessions();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].session_id, "a");
        assert_eq!(live[0].project_key, "k1");
    }
}
