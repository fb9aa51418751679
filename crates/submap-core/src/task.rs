//! Migration orchestrator.
//!
//! Drives one [`MigrationRun`] from Starting to a terminal state: claim the
//! run, count the identity table, stream identities from the stored `current`
//! offset and migrate each one. Cancellation is cooperative and checked once
//! per identity. Any error that escapes a run is recorded as an Error log
//! entry and moves the run to Error, preserving progress for a retry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorContext, Result};
use crate::gateway::{MessagesetCache, NewSubscription, SubscriptionFilter, SubscriptionGateway};
use crate::model::{LogLevel, MigrationRun, RunId};
use crate::sequence::SequenceMapper;
use crate::source::{IdentityReader, IdentitySource, DEFAULT_CHUNK_SIZE};
use crate::store::RunStore;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    /// Rows fetched from the identity cursor per round trip.
    pub chunk_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TaskConfig {
    /// Set the cursor chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// How a run execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every identity was processed and the run is Complete.
    Completed,
    /// The run left the Running state externally and execution stopped.
    Stopped,
    /// The run was not in Starting, so it was never claimed.
    NotClaimed,
    /// An error aborted the run and it was moved to Error.
    Failed,
}

/// Decides, before each identity, whether the orchestrator must stop.
/// `task_id` is the handle the orchestrator claimed the run with.
#[async_trait]
pub trait CancellationCheck: Send + Sync {
    async fn should_stop(&self, store: &RunStore, run_id: RunId, task_id: Uuid) -> Result<bool>;
}

/// Stops as soon as the run is no longer Running under this task's claim.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCheck;

#[async_trait]
impl CancellationCheck for StatusCheck {
    async fn should_stop(&self, store: &RunStore, run_id: RunId, task_id: Uuid) -> Result<bool> {
        Ok(!store.owns(run_id, task_id).await?)
    }
}

/// Runs migrations against one run store, identity source and gateway.
pub struct MigrationTask {
    store: RunStore,
    source: Arc<dyn IdentitySource>,
    gateway: Arc<dyn SubscriptionGateway>,
    mapper: Arc<SequenceMapper>,
    config: TaskConfig,
    check: Arc<dyn CancellationCheck>,
}

impl MigrationTask {
    pub fn new(
        store: RunStore,
        source: Arc<dyn IdentitySource>,
        gateway: Arc<dyn SubscriptionGateway>,
        mapper: Arc<SequenceMapper>,
    ) -> Self {
        Self {
            store,
            source,
            gateway,
            mapper,
            config: TaskConfig::default(),
            check: Arc::new(StatusCheck),
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the per-identity cancellation check.
    pub fn with_cancellation_check(mut self, check: Arc<dyn CancellationCheck>) -> Self {
        self.check = check;
        self
    }

    /// The run store this task writes to.
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Execute a run. Failures are persisted on the run and reported as
    /// [`RunOutcome::Failed`]; only a missing run or a store that cannot
    /// record the failure is returned as an error.
    #[instrument(skip(self), fields(task_id = tracing::field::Empty))]
    pub async fn run(&self, run_id: RunId) -> Result<RunOutcome> {
        let task_id = Uuid::new_v4();
        tracing::Span::current().record("task_id", tracing::field::display(task_id));

        let run = match self.claim(run_id, task_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return Ok(RunOutcome::NotClaimed),
            Err(Error::RunNotFound(id)) if id == run_id => return Err(Error::RunNotFound(id)),
            Err(err) => return self.abort(run_id, None, err).await,
        };

        match self.execute(&run, task_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.abort(run_id, Some(task_id), err).await,
        }
    }

    /// Record the failure and move the run to Error, unless another task
    /// has claimed it since.
    async fn abort(&self, run_id: RunId, owner: Option<Uuid>, err: Error) -> Result<RunOutcome> {
        let context = ErrorContext::capture(&err);
        self.store
            .log(run_id, LogLevel::Error, context.to_string())
            .await?;
        if !self.store.fail(run_id, owner).await? {
            warn!(run_id, "run is claimed by another task, status left unchanged");
        }
        Ok(RunOutcome::Failed)
    }

    /// Starting -> Running under `task_id`. Returns the run as it was read
    /// before the claim, or `None` if the run was not in Starting.
    async fn claim(&self, run_id: RunId, task_id: Uuid) -> Result<Option<MigrationRun>> {
        let run = self.store.get_run(run_id).await?;

        self.store.log(run_id, LogLevel::Info, "Setting task ID").await?;
        if !self.store.claim(run_id, task_id).await? {
            self.store.log(run_id, LogLevel::Info, "Stopping task run").await?;
            return Ok(None);
        }
        self.store
            .log(run_id, LogLevel::Info, format!("Set task ID to {task_id}"))
            .await?;
        Ok(Some(run))
    }

    /// Count, stream and migrate the identities of a claimed run.
    ///
    /// The identity count is taken only on the first execution of a run. A
    /// retried run keeps the stored total and logs "Using previously counted
    /// N identities" instead of recounting the table, so `total` is set once
    /// per run even when the table has changed since.
    async fn execute(&self, run: &MigrationRun, task_id: Uuid) -> Result<RunOutcome> {
        let run_id = run.id;
        let total = match run.total {
            Some(total) => {
                self.store
                    .log(
                        run_id,
                        LogLevel::Info,
                        format!("Using previously counted {total} identities"),
                    )
                    .await?;
                total
            }
            None => {
                self.store.log(run_id, LogLevel::Info, "Counting identities").await?;
                let total = self.source.count(&run.table_name).await?;
                self.store.set_total(run_id, total).await?;
                self.store
                    .log(run_id, LogLevel::Info, format!("Counted {total} identities"))
                    .await?;
                total
            }
        };
        debug!(run_id, total, current = run.current, "starting identity stream");

        self.store.log(run_id, LogLevel::Info, "Processing identities").await?;
        let mut cache = MessagesetCache::new();
        let mut reader = IdentityReader::open(
            self.source.as_ref(),
            &run.table_name,
            &run.column_name,
            run.current,
            self.config.chunk_size,
        )
        .await?;

        loop {
            let identity = match reader.next().await {
                Ok(Some(identity)) => identity,
                Ok(None) => break,
                Err(err) => {
                    release(reader).await;
                    return Err(err);
                }
            };

            let step = self.step(run, task_id, identity, &mut cache).await;
            match step {
                Ok(true) => {}
                Ok(false) => {
                    release(reader).await;
                    self.store.log(run_id, LogLevel::Info, "Stopping task run").await?;
                    return Ok(RunOutcome::Stopped);
                }
                Err(err) => {
                    release(reader).await;
                    return Err(err);
                }
            }
        }

        let completed_at = Utc::now();
        if !self.store.complete(run_id, task_id, completed_at).await? {
            self.store.log(run_id, LogLevel::Info, "Stopping task run").await?;
            return Ok(RunOutcome::Stopped);
        }
        self.store
            .log(
                run_id,
                LogLevel::Info,
                format!("Completed processing identities at {}", completed_at.to_rfc3339()),
            )
            .await?;
        info!(run_id, "migration run complete");
        Ok(RunOutcome::Completed)
    }

    /// Check for cancellation, migrate one identity and count it. Returns
    /// false when the run must stop, either before this identity or because
    /// the claim was lost while it was being migrated.
    async fn step(
        &self,
        run: &MigrationRun,
        task_id: Uuid,
        identity: Uuid,
        cache: &mut MessagesetCache,
    ) -> Result<bool> {
        if self.check.should_stop(&self.store, run.id, task_id).await? {
            return Ok(false);
        }
        self.migrate_identity(run, identity, cache).await?;
        self.store.increment_current(run.id, task_id).await
    }

    /// Move one identity's active subscriptions on the source messageset to
    /// the target messageset at the forward-mapped position.
    async fn migrate_identity(
        &self,
        run: &MigrationRun,
        identity: Uuid,
        cache: &mut MessagesetCache,
    ) -> Result<()> {
        let gateway = self.gateway.as_ref();
        let existing = gateway
            .subscriptions(&SubscriptionFilter::active_for(identity).messageset(run.from_messageset))
            .await?;
        let source = cache.get(gateway, run.from_messageset).await?;

        match existing.len() {
            0 => {
                self.store
                    .log(
                        run.id,
                        LogLevel::Error,
                        format!(
                            "Identity {identity} has no existing subscriptions to {}. \
                             Not migrating identity.",
                            source.short_name
                        ),
                    )
                    .await?;
                return Ok(());
            }
            1 => {}
            n => {
                self.store
                    .log(
                        run.id,
                        LogLevel::Warning,
                        format!(
                            "Identity {identity} has {n} subscriptions to {}. \
                             All will be cancelled.",
                            source.short_name
                        ),
                    )
                    .await?;
            }
        }

        for subscription in &existing {
            gateway.set_subscription_active(&subscription.id, false).await?;

            let (target_name, sequence) = self
                .mapper
                .map_forward(&source.short_name, subscription.next_sequence_number)?;
            let target = cache.by_short_name(gateway, &target_name).await?;
            if target.id != run.to_messageset {
                warn!(
                    run_id = run.id,
                    mapped = target.id,
                    expected = run.to_messageset,
                    "mapped messageset differs from the run's target"
                );
            }

            gateway
                .create_subscription(&NewSubscription {
                    identity,
                    messageset: target.id,
                    initial_sequence_number: sequence,
                    next_sequence_number: sequence,
                    lang: subscription.lang.clone(),
                    schedule: target.default_schedule,
                })
                .await?;
        }

        self.store.record_migrated(run.id, identity).await?;
        Ok(())
    }
}

/// Close a reader on an early exit. A failure to close does not mask the
/// reason for exiting.
async fn release(reader: IdentityReader) {
    if let Err(err) = reader.close().await {
        warn!(error = %err, "failed to close identity cursor");
    }
}
