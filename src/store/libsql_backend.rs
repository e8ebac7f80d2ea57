//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared behind an async mutex: the job store relies on multi-statement
//! transactions, and statements from other tasks must not interleave with
//! an open one.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{Job, JobKind, JobPayload, JobStatus, Priority};
use crate::session::model::{
    AgentSession, EventKind, SessionEvent, SessionStatus, SteeringMessage,
};
use crate::store::migrations;
use crate::store::traits::{Database, IndexEntry, KeyCounts};

const RECOVERY_LOCK_NAME: &str = "recovery";

/// libSQL database backend.
pub struct LibSqlBackend {
    /// Owner of `conn`. Never queried directly; held so the database
    /// outlives the connection opened from it.
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }

    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so string order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const JOB_COLUMNS: &str = "id, project_key, session_id, status, priority, kind, payload, work_item_slug, seq, created_at, started_at, finished_at, result, error, attempts";

const JOB_COLUMNS_J: &str = "j.id, j.project_key, j.session_id, j.status, j.priority, j.kind, j.payload, j.work_item_slug, j.seq, j.created_at, j.started_at, j.finished_at, j.result, j.error, j.attempts";

const SESSION_COLUMNS: &str = "session_id, project_key, status, work_item_slug, started_at, last_activity, last_heartbeat, updated_at";

/// Map a libsql Row to a Job. Column order matches `JOB_COLUMNS`.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("job row: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let kind_str: String = row.get(5).map_err(get_err)?;
    let payload_str: String = row.get(6).map_err(get_err)?;
    let created_str: String = row.get(9).map_err(get_err)?;
    let started_str: Option<String> = row.get(10).ok();
    let finished_str: Option<String> = row.get(11).ok();
    let attempts: i64 = row.get(14).map_err(get_err)?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?,
        project_key: row.get(1).map_err(get_err)?,
        session_id: row.get(2).map_err(get_err)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        priority: Priority::from_rank(row.get::<i64>(4).map_err(get_err)?),
        kind: kind_str.parse().unwrap_or(JobKind::Standard),
        payload: serde_json::from_str::<JobPayload>(&payload_str)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?,
        work_item_slug: row.get(7).ok(),
        seq: row.get(8).map_err(get_err)?,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
        result: row.get(12).ok(),
        error: row.get(13).ok(),
        attempts: u32::try_from(attempts).unwrap_or(0),
    })
}

/// Map a libsql Row to an AgentSession. Column order matches `SESSION_COLUMNS`.
fn row_to_session(row: &libsql::Row) -> Result<AgentSession, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("session row: {e}"));

    let status_str: String = row.get(2).map_err(get_err)?;
    let started_str: String = row.get(4).map_err(get_err)?;
    let activity_str: String = row.get(5).map_err(get_err)?;
    let heartbeat_str: String = row.get(6).map_err(get_err)?;
    let updated_str: String = row.get(7).map_err(get_err)?;

    Ok(AgentSession {
        session_id: row.get(0).map_err(get_err)?,
        project_key: row.get(1).map_err(get_err)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        work_item_slug: row.get(3).ok(),
        started_at: parse_datetime(&started_str),
        last_activity: parse_datetime(&activity_str),
        last_heartbeat: parse_datetime(&heartbeat_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_jobs(mut rows: libsql::Rows) -> Result<Vec<Job>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("read job rows"))? {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

/// Insert the primary record and its index row. Callers own the transaction.
async fn insert_job_rows(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    let payload = serde_json::to_string(&job.payload)
        .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;

    conn.execute(
        &format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            job.id.to_string(),
            job.project_key.clone(),
            job.session_id.clone(),
            job.status.as_str(),
            job.priority.rank(),
            job.kind.as_str(),
            payload,
            opt_text(job.work_item_slug.as_deref()),
            job.seq,
            fmt_ts(&job.created_at),
            opt_ts(&job.started_at),
            opt_ts(&job.finished_at),
            opt_text(job.result.as_deref()),
            opt_text(job.error.as_deref()),
            i64::from(job.attempts),
        ],
    )
    .await
    .map_err(|e| {
        let msg = e.to_string();
        if msg.contains("UNIQUE") || msg.contains("constraint") {
            DatabaseError::Constraint(format!("insert job {}: {msg}", job.id))
        } else {
            DatabaseError::Query(format!("insert job {}: {msg}", job.id))
        }
    })?;

    conn.execute(
        "INSERT INTO job_status_index (status, job_id, project_key, priority, seq) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job.status.as_str(),
            job.id.to_string(),
            job.project_key.clone(),
            job.priority.rank(),
            job.seq,
        ],
    )
    .await
    .map_err(query_err("insert job index row"))?;

    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<Job, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("begin insert_job"))?;

        let mut stored = job.clone();
        if stored.seq == 0 {
            let mut rows = tx
                .query("SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs", ())
                .await
                .map_err(query_err("next job seq"))?;
            stored.seq = match rows.next().await.map_err(query_err("next job seq"))? {
                Some(row) => row.get(0).map_err(query_err("next job seq"))?,
                None => 1,
            };
        }

        insert_job_rows(&tx, &stored).await?;
        tx.commit().await.map_err(query_err("commit insert_job"))?;

        debug!(job_id = %stored.id, seq = stored.seq, status = %stored.status, "Job inserted");
        Ok(stored)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_job"))?;

        match rows.next().await.map_err(query_err("get_job"))? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn recreate_job(&self, expected: JobStatus, updated: &Job) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("begin recreate_job"))?;

        let current = {
            let mut rows = tx
                .query(
                    "SELECT status, seq FROM jobs WHERE id = ?1",
                    params![updated.id.to_string()],
                )
                .await
                .map_err(query_err("recreate_job read"))?;
            match rows.next().await.map_err(query_err("recreate_job read"))? {
                Some(row) => {
                    let status: String = row.get(0).map_err(query_err("recreate_job status"))?;
                    let seq: i64 = row.get(1).map_err(query_err("recreate_job seq"))?;
                    Some((status, seq))
                }
                None => None,
            }
        };

        let Some((status, seq)) = current else {
            tx.rollback().await.map_err(query_err("rollback recreate_job"))?;
            return Ok(false);
        };
        if status != expected.as_str() {
            tx.rollback().await.map_err(query_err("rollback recreate_job"))?;
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM job_status_index WHERE job_id = ?1",
            params![updated.id.to_string()],
        )
        .await
        .map_err(query_err("recreate_job delete index"))?;
        tx.execute(
            "DELETE FROM jobs WHERE id = ?1",
            params![updated.id.to_string()],
        )
        .await
        .map_err(query_err("recreate_job delete record"))?;

        let mut replacement = updated.clone();
        if replacement.seq == 0 {
            replacement.seq = seq;
        }
        insert_job_rows(&tx, &replacement).await?;
        tx.commit().await.map_err(query_err("commit recreate_job"))?;

        debug!(
            job_id = %updated.id,
            from = %expected,
            to = %updated.status,
            "Job recreated"
        );
        Ok(true)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("begin delete_job"))?;
        tx.execute(
            "DELETE FROM job_status_index WHERE job_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_err("delete_job index"))?;
        let deleted = tx
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("delete_job record"))?;
        tx.commit().await.map_err(query_err("commit delete_job"))?;
        Ok(deleted > 0)
    }

    async fn next_pending_job(&self, project_key: &str) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS_J} FROM job_status_index i
                     JOIN jobs j ON j.id = i.job_id AND j.status = i.status
                     WHERE i.status = 'pending' AND i.project_key = ?1
                     ORDER BY i.priority DESC, i.seq ASC
                     LIMIT 1"
                ),
                params![project_key],
            )
            .await
            .map_err(query_err("next_pending_job"))?;

        match rows.next().await.map_err(query_err("next_pending_job"))? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        project_key: Option<&str>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS_J} FROM job_status_index i
                     JOIN jobs j ON j.id = i.job_id AND j.status = i.status
                     WHERE i.status = ?1 AND (?2 IS NULL OR i.project_key = ?2)
                     ORDER BY i.priority DESC, i.seq ASC"
                ),
                params![status.as_str(), opt_text(project_key)],
            )
            .await
            .map_err(query_err("list_jobs_by_status"))?;
        collect_jobs(rows).await
    }

    async fn list_all_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY seq ASC"),
                (),
            )
            .await
            .map_err(query_err("list_all_jobs"))?;
        collect_jobs(rows).await
    }

    async fn list_jobs_for_session(&self, session_id: &str) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE session_id = ?1 ORDER BY seq ASC"),
                params![session_id],
            )
            .await
            .map_err(query_err("list_jobs_for_session"))?;
        collect_jobs(rows).await
    }

    async fn list_index_entries(&self) -> Result<Vec<IndexEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT job_id, status FROM job_status_index ORDER BY seq ASC", ())
            .await
            .map_err(query_err("list_index_entries"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_index_entries"))? {
            let id_str: String = row.get(0).map_err(query_err("index job_id"))?;
            let status_str: String = row.get(1).map_err(query_err("index status"))?;
            let Ok(job_id) = Uuid::parse_str(&id_str) else {
                continue;
            };
            entries.push(IndexEntry {
                job_id,
                status: status_str.parse().map_err(DatabaseError::Serialization)?,
            });
        }
        Ok(entries)
    }

    async fn index_statuses(&self, job_id: Uuid) -> Result<Vec<JobStatus>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT status FROM job_status_index WHERE job_id = ?1 ORDER BY status",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("index_statuses"))?;

        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("index_statuses"))? {
            let status_str: String = row.get(0).map_err(query_err("index status"))?;
            statuses.push(status_str.parse().map_err(DatabaseError::Serialization)?);
        }
        Ok(statuses)
    }

    async fn remove_index_entry(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let removed = conn
            .execute(
                "DELETE FROM job_status_index WHERE job_id = ?1 AND status = ?2",
                params![job_id.to_string(), status.as_str()],
            )
            .await
            .map_err(query_err("remove_index_entry"))?;
        Ok(removed > 0)
    }

    async fn count_jobs_by_key(&self) -> Result<Vec<KeyCounts>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT project_key,
                        SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END)
                 FROM job_status_index
                 WHERE status IN ('pending', 'running')
                 GROUP BY project_key
                 ORDER BY project_key",
                (),
            )
            .await
            .map_err(query_err("count_jobs_by_key"))?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("count_jobs_by_key"))? {
            counts.push(KeyCounts {
                project_key: row.get(0).map_err(query_err("count key"))?,
                pending: row.get(1).map_err(query_err("count pending"))?,
                running: row.get(2).map_err(query_err("count running"))?,
            });
        }
        Ok(counts)
    }

    async fn prune_finished_jobs(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = fmt_ts(&(Utc::now() - chrono::Duration::days(i64::from(keep_days))));
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("begin prune_finished_jobs"))?;
        tx.execute(
            "DELETE FROM job_status_index WHERE job_id IN (
                SELECT id FROM jobs
                WHERE status IN ('completed', 'failed') AND finished_at < ?1
            )",
            params![cutoff.clone()],
        )
        .await
        .map_err(query_err("prune index"))?;
        let deleted = tx
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND finished_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(query_err("prune jobs"))?;
        tx.commit().await.map_err(query_err("commit prune"))?;
        Ok(deleted as usize)
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn upsert_session(&self, session: &AgentSession) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO agent_sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(session_id) DO UPDATE SET
                    project_key = excluded.project_key,
                    status = excluded.status,
                    work_item_slug = excluded.work_item_slug,
                    started_at = excluded.started_at,
                    last_activity = excluded.last_activity,
                    last_heartbeat = excluded.last_heartbeat,
                    updated_at = excluded.updated_at"
            ),
            params![
                session.session_id.clone(),
                session.project_key.clone(),
                session.status.as_str(),
                opt_text(session.work_item_slug.as_deref()),
                fmt_ts(&session.started_at),
                fmt_ts(&session.last_activity),
                fmt_ts(&session.last_heartbeat),
                fmt_ts(&session.updated_at),
            ],
        )
        .await
        .map_err(query_err("upsert_session"))?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<AgentSession>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE session_id = ?1"),
                params![session_id],
            )
            .await
            .map_err(query_err("get_session"))?;

        match rows.next().await.map_err(query_err("get_session"))? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let changed = conn
            .execute(
                "UPDATE agent_sessions SET status = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, status.as_str(), fmt_ts(&Utc::now())],
            )
            .await
            .map_err(query_err("update_session_status"))?;
        Ok(changed > 0)
    }

    async fn touch_session_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE agent_sessions SET last_activity = ?2, updated_at = ?2 WHERE session_id = ?1",
            params![session_id, fmt_ts(&at)],
        )
        .await
        .map_err(query_err("touch_session_activity"))?;
        Ok(())
    }

    async fn touch_session_heartbeat(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE agent_sessions SET last_heartbeat = ?2 WHERE session_id = ?1",
            params![session_id, fmt_ts(&at)],
        )
        .await
        .map_err(query_err("touch_session_heartbeat"))?;
        Ok(())
    }

    async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<AgentSession>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE status = ?1 ORDER BY started_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(query_err("list_sessions_by_status"))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_sessions_by_status"))? {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }

    async fn append_session_event(&self, event: &SessionEvent) -> Result<(), DatabaseError> {
        let args = serde_json::to_string(&event.args)
            .map_err(|e| DatabaseError::Serialization(format!("event args: {e}")))?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO session_events (session_id, kind, name, args, is_error, output, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.session_id.clone(),
                event.kind.as_str(),
                event.name.clone(),
                args,
                i64::from(event.is_error),
                opt_text(event.output.as_deref()),
                fmt_ts(&event.created_at),
            ],
        )
        .await
        .map_err(query_err("append_session_event"))?;
        Ok(())
    }

    async fn recent_session_events(
        &self,
        session_id: &str,
        kind: Option<EventKind>,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT session_id, kind, name, args, is_error, output, created_at
                 FROM session_events WHERE session_id = ?1 AND (?2 IS NULL OR kind = ?2)
                 ORDER BY seq DESC LIMIT ?3",
                params![
                    session_id,
                    opt_text(kind.as_ref().map(EventKind::as_str)),
                    limit as i64
                ],
            )
            .await
            .map_err(query_err("recent_session_events"))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("recent_session_events"))? {
            let kind_str: String = row.get(1).map_err(query_err("event kind"))?;
            let args_str: String = row.get(3).map_err(query_err("event args"))?;
            let created_str: String = row.get(6).map_err(query_err("event created_at"))?;
            events.push(SessionEvent {
                session_id: row.get(0).map_err(query_err("event session"))?,
                kind: kind_str.parse().map_err(DatabaseError::Serialization)?,
                name: row.get(2).map_err(query_err("event name"))?,
                args: serde_json::from_str(&args_str).unwrap_or(serde_json::Value::Null),
                is_error: row.get::<i64>(4).map_err(query_err("event is_error"))? != 0,
                output: row.get(5).ok(),
                created_at: parse_datetime(&created_str),
            });
        }
        events.reverse();
        Ok(events)
    }

    async fn prune_session_events(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = fmt_ts(&(Utc::now() - chrono::Duration::days(i64::from(keep_days))));
        let conn = self.conn().await;
        let deleted = conn
            .execute(
                "DELETE FROM session_events
                 WHERE created_at < ?1
                   AND session_id NOT IN (SELECT session_id FROM agent_sessions WHERE status = 'active')",
                params![cutoff],
            )
            .await
            .map_err(query_err("prune_session_events"))?;
        Ok(deleted as usize)
    }

    // ── Steering ────────────────────────────────────────────────────

    async fn push_steering(
        &self,
        message: &SteeringMessage,
    ) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn().await;
        // Guarded insert: a session finalized between the caller's status
        // check and this write must not swallow the message.
        let inserted = conn
            .execute(
                "INSERT INTO steering_messages (session_id, text, sender, is_abort, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5
                 WHERE EXISTS (SELECT 1 FROM agent_sessions WHERE session_id = ?1 AND status = ?6)",
                params![
                    message.session_id.clone(),
                    message.text.clone(),
                    message.sender.clone(),
                    i64::from(message.is_abort),
                    fmt_ts(&message.timestamp),
                    SessionStatus::Active.as_str(),
                ],
            )
            .await
            .map_err(query_err("push_steering"))?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    async fn pop_steering(
        &self,
        session_id: &str,
    ) -> Result<Option<SteeringMessage>, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("begin pop_steering"))?;

        let popped = {
            let mut rows = tx
                .query(
                    "SELECT seq, text, sender, is_abort, created_at FROM steering_messages
                     WHERE session_id = ?1 ORDER BY seq ASC LIMIT 1",
                    params![session_id],
                )
                .await
                .map_err(query_err("pop_steering read"))?;
            match rows.next().await.map_err(query_err("pop_steering read"))? {
                Some(row) => {
                    let seq: i64 = row.get(0).map_err(query_err("steering seq"))?;
                    let created_str: String = row.get(4).map_err(query_err("steering ts"))?;
                    Some((
                        seq,
                        SteeringMessage {
                            session_id: session_id.to_string(),
                            text: row.get(1).map_err(query_err("steering text"))?,
                            sender: row.get(2).map_err(query_err("steering sender"))?,
                            is_abort: row.get::<i64>(3).map_err(query_err("steering abort"))? != 0,
                            timestamp: parse_datetime(&created_str),
                        },
                    ))
                }
                None => None,
            }
        };

        let Some((seq, message)) = popped else {
            tx.rollback().await.map_err(query_err("rollback pop_steering"))?;
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM steering_messages WHERE seq = ?1",
            params![seq],
        )
        .await
        .map_err(query_err("pop_steering delete"))?;
        tx.commit().await.map_err(query_err("commit pop_steering"))?;
        Ok(Some(message))
    }

    async fn clear_steering(&self, session_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.conn().await;
        let removed = conn
            .execute(
                "DELETE FROM steering_messages WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(query_err("clear_steering"))?;
        Ok(removed as usize)
    }

    async fn count_steering(&self, session_id: &str) -> Result<usize, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM steering_messages WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(query_err("count_steering"))?;
        match rows.next().await.map_err(query_err("count_steering"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err("count_steering"))? as usize),
            None => Ok(0),
        }
    }

    // ── Recovery lock ───────────────────────────────────────────────

    async fn try_acquire_recovery_lock(
        &self,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120));

        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(query_err("begin acquire lock"))?;

        tx.execute(
            "DELETE FROM recovery_lock WHERE name = ?1 AND expires_at <= ?2",
            params![RECOVERY_LOCK_NAME, fmt_ts(&now)],
        )
        .await
        .map_err(query_err("expire recovery lock"))?;

        let current_holder: Option<String> = {
            let mut rows = tx
                .query(
                    "SELECT holder FROM recovery_lock WHERE name = ?1",
                    params![RECOVERY_LOCK_NAME],
                )
                .await
                .map_err(query_err("read recovery lock"))?;
            match rows.next().await.map_err(query_err("read recovery lock"))? {
                Some(row) => Some(row.get(0).map_err(query_err("lock holder"))?),
                None => None,
            }
        };

        if let Some(current) = current_holder
            && current != holder
        {
            tx.rollback().await.map_err(query_err("rollback acquire lock"))?;
            return Ok(false);
        }

        tx.execute(
            "INSERT OR REPLACE INTO recovery_lock (name, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![RECOVERY_LOCK_NAME, holder, fmt_ts(&now), fmt_ts(&expires_at)],
        )
        .await
        .map_err(query_err("write recovery lock"))?;
        tx.commit().await.map_err(query_err("commit acquire lock"))?;
        Ok(true)
    }

    async fn release_recovery_lock(&self, holder: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "DELETE FROM recovery_lock WHERE name = ?1 AND holder = ?2",
            params![RECOVERY_LOCK_NAME, holder],
        )
        .await
        .map_err(query_err("release recovery lock"))?;
        Ok(())
    }

    async fn recovery_lock_holder(
        &self,
    ) -> Result<Option<(String, DateTime<Utc>)>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT holder, expires_at FROM recovery_lock WHERE name = ?1 AND expires_at > ?2",
                params![RECOVERY_LOCK_NAME, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(query_err("recovery_lock_holder"))?;
        match rows.next().await.map_err(query_err("recovery_lock_holder"))? {
            Some(row) => {
                let holder: String = row.get(0).map_err(query_err("lock holder"))?;
                let expires_str: String = row.get(1).map_err(query_err("lock expiry"))?;
                Ok(Some((holder, parse_datetime(&expires_str))))
            }
            None => Ok(None),
        }
    }
}
