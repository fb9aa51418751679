//! Run store on SQLite.
//!
//! Holds migration runs, their log entries and the migrated/reverted identity
//! records. Every status change that can race with another actor is a single
//! conditional `UPDATE ... WHERE status IN (...)` whose affected-row count
//! tells the caller whether it won. Writes made by an orchestrator are also
//! scoped by the task handle it claimed the run with.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{IdentityRecord, LogEntry, LogLevel, MigrationRun, NewRun, RunId, RunStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS migration_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT UNIQUE,
    status TEXT NOT NULL DEFAULT 'starting',
    from_messageset INTEGER NOT NULL,
    to_messageset INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    total INTEGER,
    current INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_migration_runs_created ON migration_runs(created_at DESC);

CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES migration_runs(id) ON DELETE CASCADE,
    level INTEGER NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_log_entries_run ON log_entries(run_id, created_at);

CREATE TABLE IF NOT EXISTS migrated_identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES migration_runs(id) ON DELETE CASCADE,
    identity TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migrated_identities_identity ON migrated_identities(identity);

CREATE TABLE IF NOT EXISTS reverted_identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES migration_runs(id) ON DELETE CASCADE,
    identity TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reverted_identities_identity ON reverted_identities(identity);
"#;

const RUN_COLUMNS: &str = "id, task_id, status, from_messageset, to_messageset, table_name, \
     column_name, total, current, created_at, completed_at";

/// Which identity record table to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityTable {
    Migrated,
    Reverted,
}

impl IdentityTable {
    const fn name(self) -> &'static str {
        match self {
            IdentityTable::Migrated => "migrated_identities",
            IdentityTable::Reverted => "reverted_identities",
        }
    }
}

/// Persistent store for migration runs.
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    /// Open (creating if missing) the store at a SQLite URL and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database, so keep exactly one alive.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        }
        .connect_with(options)
        .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open a private in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Apply the schema.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Check connectivity.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Persist a new run in the Starting state.
    pub async fn create_run(&self, new: &NewRun) -> Result<MigrationRun> {
        new.validate()?;
        let result = sqlx::query(
            "INSERT INTO migration_runs \
             (status, from_messageset, to_messageset, table_name, column_name, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(RunStatus::Starting.as_str())
        .bind(new.from_messageset)
        .bind(new.to_messageset)
        .bind(&new.table_name)
        .bind(&new.column_name)
        .bind(Utc::now().timestamp_micros())
        .execute(&self.pool)
        .await?;

        self.get_run(result.last_insert_rowid()).await
    }

    /// Fetch a run.
    pub async fn get_run(&self, id: RunId) -> Result<MigrationRun> {
        self.find_run(id).await?.ok_or(Error::RunNotFound(id))
    }

    /// Fetch a run if it exists.
    pub async fn find_run(&self, id: RunId) -> Result<Option<MigrationRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM migration_runs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    /// Runs, newest first.
    pub async fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<MigrationRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM migration_runs \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    /// Total number of runs.
    pub async fn count_runs(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migration_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Current status of a run, read fresh from the store.
    pub async fn status(&self, id: RunId) -> Result<RunStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM migration_runs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        status.ok_or(Error::RunNotFound(id))?.parse()
    }

    /// Delete a run together with its log entries and identity records.
    pub async fn delete_run(&self, id: RunId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM migration_runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // Status transitions
    // -------------------------------------------------------------------------

    /// Starting -> Running, recording the claiming task. Returns false if the
    /// run was not in Starting.
    pub async fn claim(&self, id: RunId, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE migration_runs SET task_id = ?, status = ? WHERE id = ? AND status = ?",
        )
        .bind(task_id.to_string())
        .bind(RunStatus::Running.as_str())
        .bind(id)
        .bind(RunStatus::Starting.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Running -> Complete for the task holding the claim, stamping the
    /// completion time.
    pub async fn complete(
        &self,
        id: RunId,
        task_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE migration_runs SET status = ?, completed_at = ? \
             WHERE id = ? AND status = ? AND task_id = ?",
        )
        .bind(RunStatus::Complete.as_str())
        .bind(completed_at.timestamp_micros())
        .bind(id)
        .bind(RunStatus::Running.as_str())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Error|Cancelled -> Starting. The previous task's claim is dropped so a
    /// stale orchestrator cannot act on the re-queued run.
    pub async fn retry(&self, id: RunId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE migration_runs SET status = ?, task_id = NULL \
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(RunStatus::Starting.as_str())
        .bind(id)
        .bind(RunStatus::Error.as_str())
        .bind(RunStatus::Cancelled.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Starting|Running -> Cancelled.
    pub async fn cancel(&self, id: RunId) -> Result<bool> {
        self.transition(id, &[RunStatus::Starting, RunStatus::Running], RunStatus::Cancelled)
            .await
    }

    /// Mark the run as failed.
    ///
    /// With an owner, the update applies whatever the status is, as long as
    /// that task still holds the claim. Without one (a failure before the
    /// claim), only an unclaimed Starting run is moved.
    pub async fn fail(&self, id: RunId, owner: Option<Uuid>) -> Result<bool> {
        let result = match owner {
            Some(task_id) => {
                sqlx::query("UPDATE migration_runs SET status = ? WHERE id = ? AND task_id = ?")
                    .bind(RunStatus::Error.as_str())
                    .bind(id)
                    .bind(task_id.to_string())
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "UPDATE migration_runs SET status = ? \
                     WHERE id = ? AND status = ? AND task_id IS NULL",
                )
                .bind(RunStatus::Error.as_str())
                .bind(id)
                .bind(RunStatus::Starting.as_str())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    /// Whether `task_id` holds the claim on a Running run.
    pub async fn owns(&self, id: RunId, task_id: Uuid) -> Result<bool> {
        let owned: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM migration_runs WHERE id = ? AND status = ? AND task_id = ?",
        )
        .bind(id)
        .bind(RunStatus::Running.as_str())
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(owned.is_some())
    }

    /// Move to `next` only if the current status is one of `expected`.
    pub async fn transition(
        &self,
        id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
    ) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; expected.len()].join(", ");
        let sql = format!(
            "UPDATE migration_runs SET status = ? WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(next.as_str()).bind(id);
        for status in expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;

        let changed = result.rows_affected() == 1;
        debug!(run_id = id, to = %next, changed, "conditional status transition");
        Ok(changed)
    }

    // -------------------------------------------------------------------------
    // Progress
    // -------------------------------------------------------------------------

    /// Record the number of identities to process.
    pub async fn set_total(&self, id: RunId, total: u64) -> Result<()> {
        sqlx::query("UPDATE migration_runs SET total = ? WHERE id = ?")
            .bind(total as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically add one processed identity, if `task_id` still holds the
    /// claim. A cancelled run keeps its claim until it is retried.
    pub async fn increment_current(&self, id: RunId, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE migration_runs SET current = current + 1 WHERE id = ? AND task_id = ?",
        )
        .bind(id)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------------

    /// Append a log entry to a run and mirror it to tracing.
    pub async fn log(
        &self,
        run_id: RunId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<LogEntry> {
        let message = message.into();
        match level {
            LogLevel::Critical | LogLevel::Error => error!(run_id, "{message}"),
            LogLevel::Warning => warn!(run_id, "{message}"),
            LogLevel::Info => info!(run_id, "{message}"),
            LogLevel::Debug | LogLevel::NotSet => debug!(run_id, "{message}"),
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO log_entries (run_id, level, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(level.value())
        .bind(&message)
        .bind(created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(LogEntry {
            id: result.last_insert_rowid(),
            run_id,
            level,
            message,
            created_at: truncate_to_micros(created_at)?,
        })
    }

    /// Log entries of a run in insertion order.
    pub async fn list_logs(&self, run_id: RunId, limit: u32, offset: u32) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT id, run_id, level, message, created_at FROM log_entries \
             WHERE run_id = ? ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(run_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<LogEntry> {
                Ok(LogEntry {
                    id: row.try_get("id")?,
                    run_id: row.try_get("run_id")?,
                    level: LogLevel::from_value(row.try_get("level")?)?,
                    message: row.try_get("message")?,
                    created_at: from_micros(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    /// Number of log entries of a run.
    pub async fn count_logs(&self, run_id: RunId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_entries WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    // -------------------------------------------------------------------------
    // Identity records
    // -------------------------------------------------------------------------

    /// Record that a run migrated an identity.
    pub async fn record_migrated(&self, run_id: RunId, identity: Uuid) -> Result<()> {
        self.record_identity(IdentityTable::Migrated, run_id, identity)
            .await
    }

    /// Record that an identity's migration by a run was reverted.
    pub async fn record_reverted(&self, run_id: RunId, identity: Uuid) -> Result<()> {
        self.record_identity(IdentityTable::Reverted, run_id, identity)
            .await
    }

    /// Identities migrated by a run, in insertion order.
    pub async fn migrated_identities(&self, run_id: RunId) -> Result<Vec<IdentityRecord>> {
        self.identity_records(IdentityTable::Migrated, run_id).await
    }

    /// Identities reverted from a run, in insertion order.
    pub async fn reverted_identities(&self, run_id: RunId) -> Result<Vec<IdentityRecord>> {
        self.identity_records(IdentityTable::Reverted, run_id).await
    }

    /// The most recently created run that migrated an identity.
    pub async fn latest_migration_for(&self, identity: Uuid) -> Result<Option<MigrationRun>> {
        let columns = RUN_COLUMNS
            .split(", ")
            .map(|column| format!("r.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let row = sqlx::query(&format!(
            "SELECT {columns} FROM migrated_identities m \
             JOIN migration_runs r ON r.id = m.run_id \
             WHERE m.identity = ? \
             ORDER BY r.created_at DESC, r.id DESC LIMIT 1"
        ))
        .bind(identity.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn record_identity(&self, table: IdentityTable, run_id: RunId, identity: Uuid) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (run_id, identity, created_at) VALUES (?, ?, ?)",
            table.name()
        ))
        .bind(run_id)
        .bind(identity.to_string())
        .bind(Utc::now().timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn identity_records(&self, table: IdentityTable, run_id: RunId) -> Result<Vec<IdentityRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT id, run_id, identity, created_at FROM {} WHERE run_id = ? ORDER BY id",
            table.name()
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<IdentityRecord> {
                let identity: String = row.try_get("identity")?;
                Ok(IdentityRecord {
                    id: row.try_get("id")?,
                    run_id: row.try_get("run_id")?,
                    identity: parse_uuid(&identity)?,
                    created_at: from_micros(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

fn run_from_row(row: &SqliteRow) -> Result<MigrationRun> {
    let task_id: Option<String> = row.try_get("task_id")?;
    let status: String = row.try_get("status")?;
    let total: Option<i64> = row.try_get("total")?;
    let current: i64 = row.try_get("current")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(MigrationRun {
        id: row.try_get("id")?,
        task_id: task_id.as_deref().map(parse_uuid).transpose()?,
        status: status.parse()?,
        from_messageset: row.try_get("from_messageset")?,
        to_messageset: row.try_get("to_messageset")?,
        table_name: row.try_get("table_name")?,
        column_name: row.try_get("column_name")?,
        total: total.map(|t| t.max(0) as u64),
        current: current.max(0) as u64,
        created_at: from_micros(row.try_get("created_at")?)?,
        completed_at: completed_at.map(from_micros).transpose()?,
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Corrupt(format!("invalid uuid {raw:?}: {e}")))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Corrupt(format!("timestamp out of range: {micros}")))
}

fn truncate_to_micros(at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    from_micros(at.timestamp_micros())
}
