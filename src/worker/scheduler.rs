//! Per-key worker scheduling.
//!
//! Guarantees at most one worker loop per project key. A loop retires when
//! its queue is empty; the retirement check and `ensure_worker` share one
//! lock, so a job enqueued while a loop is retiring is never stranded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::JobError;
use crate::worker::worker::{WorkerDeps, WorkerLoop};

struct WorkerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

type WorkerTable = Arc<Mutex<HashMap<String, WorkerSlot>>>;

/// Starts and tracks worker loops.
pub struct Scheduler {
    deps: WorkerDeps,
    workers: WorkerTable,
    next_generation: AtomicU64,
}

impl Scheduler {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }

    /// Start a worker loop for `project_key` unless one is already running.
    /// Returns whether a new loop was spawned.
    pub async fn ensure_worker(&self, project_key: &str) -> bool {
        let mut workers = self.workers.lock().await;
        if let Some(slot) = workers.get(project_key) {
            if !slot.handle.is_finished() {
                return false;
            }
            tracing::warn!(project_key, "Replacing worker loop that ended unexpectedly");
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(worker_task(
            WorkerLoop::new(project_key, self.deps.clone()),
            Arc::clone(&self.workers),
            generation,
        ));
        workers.insert(project_key.to_string(), WorkerSlot { generation, handle });
        tracing::info!(project_key, "Worker loop started");
        true
    }

    /// Start workers for every key that has pending jobs.
    pub async fn ensure_workers_for_pending(&self) -> Result<usize, JobError> {
        let mut started = 0;
        for counts in self.deps.queue.counts_by_key().await? {
            if counts.pending > 0 && self.ensure_worker(&counts.project_key).await {
                started += 1;
            }
        }
        Ok(started)
    }

    pub async fn is_running(&self, project_key: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(project_key)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    pub async fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .workers
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Wait until every worker loop has retired.
    pub async fn wait_idle(&self) {
        loop {
            {
                let mut workers = self.workers.lock().await;
                workers.retain(|_, slot| !slot.handle.is_finished());
                if workers.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Abort every worker loop. Running jobs stay Running and are reset by
    /// startup recovery on the next boot.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for (project_key, slot) in workers.drain() {
            slot.handle.abort();
            tracing::info!(project_key = %project_key, "Worker loop stopped");
        }
    }
}

async fn worker_task(worker: WorkerLoop, workers: WorkerTable, generation: u64) {
    loop {
        worker.run_until_idle().await;

        // Re-check under the lock: `ensure_worker` holds it too, so anything
        // enqueued before its call is either visible here or gets a fresh loop.
        let mut table = workers.lock().await;
        if worker.has_pending().await {
            continue;
        }
        if table
            .get(worker.project_key())
            .is_some_and(|slot| slot.generation == generation)
        {
            table.remove(worker.project_key());
        }
        tracing::info!(project_key = %worker.project_key(), "Worker loop retired");
        return;
    }
}

/// Spawn the background sweep that starts workers for keys with pending
/// jobs enqueued by other processes (CLI `submit`, recovery).
pub fn spawn_queue_sweeper(scheduler: Arc<Scheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match scheduler.ensure_workers_for_pending().await {
                Ok(0) => {}
                Ok(started) => tracing::info!(started, "Queue sweep started workers"),
                Err(e) => tracing::warn!(error = %e, "Queue sweep failed"),
            }
        }
    })
}
