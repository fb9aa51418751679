//! JSON request and response types.

use serde::{Deserialize, Serialize};
use submap_core::{LogEntry, MigrationRun, Subscription};
use uuid::Uuid;

/// Runs per page when no limit is given.
pub const DEFAULT_RUN_PAGE_SIZE: u32 = 5;

/// Log entries per page when no limit is given.
pub const DEFAULT_LOG_PAGE_SIZE: u32 = 10;

/// Largest page a client may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Health status.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Whether the run store answered.
    pub run_store: bool,
}

/// `limit` and `offset` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageParams {
    /// Limit clamped to `1..=MAX_PAGE_SIZE`, or `default`.
    pub fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

/// One page of a listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct PageResponse<T> {
    /// Total number of items.
    pub count: u64,
    pub limit: u32,
    pub offset: u32,
    pub results: Vec<T>,
}

/// A migration run with its derived state.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub id: i64,
    pub task_id: Option<Uuid>,
    pub status: String,
    pub from_messageset: i64,
    pub to_messageset: i64,
    pub table_name: String,
    pub column_name: String,
    pub total: Option<u64>,
    pub current: u64,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub progress_percent: Option<f64>,
    pub can_be_cancelled: bool,
    pub can_be_resumed: bool,
    /// Human readable summary.
    pub description: String,
}

impl From<&MigrationRun> for RunResponse {
    fn from(run: &MigrationRun) -> Self {
        Self {
            id: run.id,
            task_id: run.task_id,
            status: run.status.as_str().to_string(),
            from_messageset: run.from_messageset,
            to_messageset: run.to_messageset,
            table_name: run.table_name.clone(),
            column_name: run.column_name.clone(),
            total: run.total,
            current: run.current,
            created_at: run.created_at.to_rfc3339(),
            completed_at: run.completed_at.map(|at| at.to_rfc3339()),
            progress_percent: run.progress_percent(),
            can_be_cancelled: run.can_be_cancelled(),
            can_be_resumed: run.can_be_resumed(),
            description: run.to_string(),
        }
    }
}

/// A run log entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntryResponse {
    pub id: i64,
    /// Numeric severity.
    pub level: i64,
    /// Severity label.
    pub level_name: String,
    pub message: String,
    pub created_at: String,
}

impl From<&LogEntry> for LogEntryResponse {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id,
            level: entry.level.value(),
            level_name: entry.level.label().to_string(),
            message: entry.message.clone(),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// A messageset choice for run submission.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagesetChoice {
    pub id: i64,
    pub short_name: String,
}

/// Optout trigger body.
#[derive(Debug, Deserialize)]
pub struct OptoutRequest {
    pub contact: Uuid,
}

/// Subscriptions touched by an optout.
#[derive(Debug, Serialize, Deserialize)]
pub struct OptoutResponse {
    pub cancelled_subscriptions: Vec<Subscription>,
    pub created_subscriptions: Vec<Subscription>,
}
