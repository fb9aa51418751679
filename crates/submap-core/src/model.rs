//! Persisted records: migration runs, their log entries, and the identities
//! each run migrated or had reverted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::source::quote_identifier;

/// Primary key of a migration run.
pub type RunId = i64;

/// Lifecycle state of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created or re-queued, waiting to be claimed.
    Starting,
    /// Claimed by an orchestrator.
    Running,
    /// Halted externally.
    Cancelled,
    /// Aborted by a failure.
    Error,
    /// All identities processed.
    Complete,
}

impl RunStatus {
    /// Value stored in the run table.
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
            RunStatus::Complete => "complete",
        }
    }

    /// Human readable label.
    pub const fn label(self) -> &'static str {
        match self {
            RunStatus::Starting => "Starting",
            RunStatus::Running => "Running",
            RunStatus::Cancelled => "Cancelled",
            RunStatus::Error => "Error",
            RunStatus::Complete => "Complete",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(RunStatus::Starting),
            "running" => Ok(RunStatus::Running),
            "cancelled" => Ok(RunStatus::Cancelled),
            "error" => Ok(RunStatus::Error),
            "complete" => Ok(RunStatus::Complete),
            other => Err(Error::Corrupt(format!("unknown run status {other:?}"))),
        }
    }
}

/// One bulk migration of subscriptions from a source to a target messageset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRun {
    pub id: RunId,
    /// Handle of the orchestrator that claimed the run.
    pub task_id: Option<Uuid>,
    pub status: RunStatus,
    pub from_messageset: i64,
    pub to_messageset: i64,
    /// Identity source table.
    pub table_name: String,
    /// Identity key column in `table_name`.
    pub column_name: String,
    /// Number of identities in the source table, once counted.
    pub total: Option<u64>,
    /// Identities fully migrated or skipped so far.
    pub current: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationRun {
    /// Whether the run is in a state that allows it to be cancelled.
    pub fn can_be_cancelled(&self) -> bool {
        matches!(self.status, RunStatus::Starting | RunStatus::Running)
    }

    /// Whether the run is in a state that allows it to be resumed.
    pub fn can_be_resumed(&self) -> bool {
        matches!(self.status, RunStatus::Cancelled | RunStatus::Error)
    }

    /// Percentage of identities processed, once the total is known.
    pub fn progress_percent(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.current as f64 / total as f64) * 100.0
            }
        })
    }
}

impl fmt::Display for MigrationRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} migrate {} on {} from message set {} with task ",
            self.status.label(),
            self.column_name,
            self.table_name,
            self.from_messageset
        )?;
        match self.task_id {
            Some(task_id) => write!(f, "{task_id}"),
            None => f.write_str("None"),
        }
    }
}

/// Request to create a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRun {
    pub from_messageset: i64,
    pub to_messageset: i64,
    pub table_name: String,
    pub column_name: String,
}

impl NewRun {
    /// Check the request before it is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.from_messageset == self.to_messageset {
            return Err(Error::InvalidRun(
                "source and target messagesets must differ".to_string(),
            ));
        }
        quote_identifier(&self.table_name)?;
        quote_identifier(&self.column_name)?;
        if self.column_name.contains('.') {
            return Err(Error::InvalidIdentifier(self.column_name.clone()));
        }
        Ok(())
    }
}

/// Severity of a run log entry, on the conventional numeric scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    NotSet,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Numeric value stored in the log table.
    pub const fn value(self) -> i64 {
        match self {
            LogLevel::NotSet => 0,
            LogLevel::Debug => 10,
            LogLevel::Info => 20,
            LogLevel::Warning => 30,
            LogLevel::Error => 40,
            LogLevel::Critical => 50,
        }
    }

    /// Decode a stored numeric level.
    pub fn from_value(value: i64) -> Result<Self> {
        match value {
            0 => Ok(LogLevel::NotSet),
            10 => Ok(LogLevel::Debug),
            20 => Ok(LogLevel::Info),
            30 => Ok(LogLevel::Warning),
            40 => Ok(LogLevel::Error),
            50 => Ok(LogLevel::Critical),
            other => Err(Error::Corrupt(format!("unknown log level {other}"))),
        }
    }

    /// Human readable label.
    pub const fn label(self) -> &'static str {
        match self {
            LogLevel::NotSet => "Not Set",
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Append-only audit entry for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub run_id: RunId,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {}",
            self.created_at.to_rfc3339(),
            self.level,
            self.message
        )
    }
}

/// An identity migrated by, or reverted from, a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityRecord {
    pub id: i64,
    pub run_id: RunId,
    pub identity: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: RunStatus) -> MigrationRun {
        MigrationRun {
            id: 1,
            task_id: None,
            status,
            from_messageset: 2,
            to_messageset: 3,
            table_name: "identities".to_string(),
            column_name: "identity_id".to_string(),
            total: None,
            current: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_status_round_trips_through_storage_value() {
        for status in [
            RunStatus::Starting,
            RunStatus::Running,
            RunStatus::Cancelled,
            RunStatus::Error,
            RunStatus::Complete,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_cancel_and_resume_guards() {
        assert!(run(RunStatus::Starting).can_be_cancelled());
        assert!(run(RunStatus::Running).can_be_cancelled());
        assert!(!run(RunStatus::Complete).can_be_cancelled());
        assert!(!run(RunStatus::Error).can_be_cancelled());

        assert!(run(RunStatus::Error).can_be_resumed());
        assert!(run(RunStatus::Cancelled).can_be_resumed());
        assert!(!run(RunStatus::Running).can_be_resumed());
        assert!(!run(RunStatus::Starting).can_be_resumed());
    }

    #[test]
    fn test_progress_percent() {
        let mut r = run(RunStatus::Running);
        assert_eq!(r.progress_percent(), None);
        r.total = Some(0);
        assert_eq!(r.progress_percent(), Some(100.0));
        r.total = Some(8);
        r.current = 2;
        assert_eq!(r.progress_percent(), Some(25.0));
    }

    #[test]
    fn test_run_display() {
        assert_eq!(
            run(RunStatus::Running).to_string(),
            "Running migrate identity_id on identities from message set 2 with task None"
        );
    }

    #[test]
    fn test_new_run_validation() {
        let mut new = NewRun {
            from_messageset: 1,
            to_messageset: 2,
            table_name: "public.identities".to_string(),
            column_name: "identity_id".to_string(),
        };
        assert!(new.validate().is_ok());

        new.column_name = "id; DROP TABLE x".to_string();
        assert!(matches!(new.validate(), Err(Error::InvalidIdentifier(_))));

        new.column_name = "public.identity_id".to_string();
        assert!(new.validate().is_err());

        new.column_name = "identity_id".to_string();
        new.to_messageset = 1;
        assert!(matches!(new.validate(), Err(Error::InvalidRun(_))));
    }

    #[test]
    fn test_log_levels() {
        for level in [
            LogLevel::NotSet,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ] {
            assert_eq!(LogLevel::from_value(level.value()).unwrap(), level);
        }
        assert!(LogLevel::Error > LogLevel::Warning);
        assert!(LogLevel::from_value(15).is_err());
    }
}
