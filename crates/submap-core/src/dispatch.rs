//! Background execution of migration runs.
//!
//! Submission, retry and cancel actions plus the spawning of orchestrators on
//! the tokio runtime. A semaphore bounds how many runs execute at once; the
//! claim inside [`MigrationTask`] remains the only guard against a run being
//! executed twice.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::error::{Error, Result};
use crate::model::{LogLevel, MigrationRun, NewRun, RunId};
use crate::store::RunStore;
use crate::task::{MigrationTask, RunOutcome};

/// Default number of runs executing concurrently.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

/// Spawns migration tasks and applies run actions.
#[derive(Clone)]
pub struct Dispatcher {
    task: Arc<MigrationTask>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Create a dispatcher running at most `max_concurrent` runs at once.
    pub fn new(task: MigrationTask, max_concurrent: usize) -> Self {
        Self {
            task: Arc::new(task),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn store(&self) -> &RunStore {
        self.task.store()
    }

    /// Spawn the orchestrator for a run. The task waits for a permit before
    /// claiming the run.
    pub fn dispatch(&self, run_id: RunId) -> JoinHandle<Result<RunOutcome>> {
        let task = self.task.clone();
        let permits = self.permits.clone();

        tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Err(Error::Dispatch("dispatcher is shut down".to_string()));
                };

                let result = task.run(run_id).await;
                match &result {
                    Ok(outcome) => info!(?outcome, "migration run finished"),
                    Err(err) => error!(error = %err, "migration run could not be executed"),
                }
                result
            }
            .instrument(info_span!("migration_run", run_id)),
        )
    }

    /// Persist a new run and dispatch it.
    pub async fn submit(&self, new: &NewRun) -> Result<MigrationRun> {
        let store = self.store();
        let run = store.create_run(new).await?;
        store
            .log(
                run.id,
                LogLevel::Info,
                format!(
                    "Created migration from message set {} to message set {} using {}.{}",
                    run.from_messageset, run.to_messageset, run.table_name, run.column_name
                ),
            )
            .await?;
        self.dispatch(run.id);
        Ok(run)
    }

    /// Re-queue a run in Error or Cancelled and dispatch it again.
    pub async fn retry(&self, run_id: RunId) -> Result<MigrationRun> {
        let store = self.store();
        store.get_run(run_id).await?;
        if !store.retry(run_id).await? {
            return Err(Error::Conflict(
                "Subscription migration must be in error or cancelled state to be retried."
                    .to_string(),
            ));
        }
        store.log(run_id, LogLevel::Info, "Retrying task").await?;
        self.dispatch(run_id);
        store.get_run(run_id).await
    }

    /// Cancel a run in Starting or Running. A running orchestrator stops at
    /// the next identity boundary.
    pub async fn cancel(&self, run_id: RunId) -> Result<MigrationRun> {
        let store = self.store();
        store.get_run(run_id).await?;
        if !store.cancel(run_id).await? {
            return Err(Error::Conflict(
                "Subscription migration must be in starting or running state to be cancelled."
                    .to_string(),
            ));
        }
        store.log(run_id, LogLevel::Info, "Cancelling task").await?;
        store.get_run(run_id).await
    }

    /// Stop accepting new work. Already spawned runs waiting for a permit
    /// fail with [`Error::Dispatch`].
    pub fn close(&self) {
        self.permits.close();
    }
}
