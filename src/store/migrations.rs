//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "job_store",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                project_key TEXT NOT NULL,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                kind TEXT NOT NULL DEFAULT 'standard',
                payload TEXT NOT NULL,
                work_item_slug TEXT,
                seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                result TEXT,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_id);

            CREATE TABLE IF NOT EXISTS job_status_index (
                status TEXT NOT NULL,
                job_id TEXT NOT NULL,
                project_key TEXT NOT NULL,
                priority INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (status, job_id)
            );
            CREATE INDEX IF NOT EXISTS idx_job_status_index_pop
                ON job_status_index(status, project_key, priority DESC, seq ASC);
            CREATE INDEX IF NOT EXISTS idx_job_status_index_job ON job_status_index(job_id);
        "#,
    },
    Migration {
        version: 2,
        name: "sessions_and_steering",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_sessions (
                session_id TEXT PRIMARY KEY,
                project_key TEXT NOT NULL,
                status TEXT NOT NULL,
                work_item_slug TEXT,
                started_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_sessions_status ON agent_sessions(status);

            CREATE TABLE IF NOT EXISTS session_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                args TEXT NOT NULL DEFAULT 'null',
                is_error INTEGER NOT NULL DEFAULT 0,
                output TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_events_session
                ON session_events(session_id, seq);

            CREATE TABLE IF NOT EXISTS steering_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                text TEXT NOT NULL,
                sender TEXT NOT NULL,
                is_abort INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_steering_session ON steering_messages(session_id, seq);
        "#,
    },
    Migration {
        version: 3,
        name: "recovery_lock",
        sql: r#"
            CREATE TABLE IF NOT EXISTS recovery_lock (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> (libsql::Database, Connection) {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        let conn = db.connect().unwrap();
        (db, conn)
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                libsql::params![name],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let (_db, conn) = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in [
            "jobs",
            "job_status_index",
            "agent_sessions",
            "session_events",
            "steering_messages",
            "recovery_lock",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn migration_future_can_cross_threads() {
        fn assert_send<T: Send>(value: T) -> T {
            value
        }
        let (_db, conn) = test_conn().await;
        tokio::spawn(async move { assert_send(run_migrations(&conn)).await })
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_db, conn) = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let (_db, conn) = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            seen.push((row.get::<i64>(0).unwrap(), row.get::<String>(1).unwrap()));
        }
        assert_eq!(
            seen,
            vec![
                (1, "job_store".to_string()),
                (2, "sessions_and_steering".to_string()),
                (3, "recovery_lock".to_string()),
            ]
        );
    }
}
