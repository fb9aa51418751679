//! End-to-end migration runs against in-memory collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use submap_core::testing::{CancelBefore, MemoryGateway, MemoryIdentitySource};
use submap_core::{
    CancellationCheck, Error, LogLevel, MigrationTask, NewRun, RunId, RunOutcome, RunStatus,
    RunStore, SequenceMapper, SequenceRule, StatusCheck, TaskConfig, Transform,
};
use uuid::Uuid;

const PREBIRTH: i64 = 1;
const POSTBIRTH: i64 = 2;

async fn store_with_run() -> (RunStore, RunId) {
    let store = RunStore::in_memory().await.unwrap();
    let run = store
        .create_run(&NewRun {
            from_messageset: PREBIRTH,
            to_messageset: POSTBIRTH,
            table_name: "identities".to_string(),
            column_name: "identity_id".to_string(),
        })
        .await
        .unwrap();
    (store, run.id)
}

fn gateway() -> MemoryGateway {
    MemoryGateway::new()
        .with_messageset(PREBIRTH, "gates_prebirth", 3)
        .with_messageset(POSTBIRTH, "gates_postbirth", 7)
}

fn noop_mapper() -> Arc<SequenceMapper> {
    Arc::new(
        SequenceMapper::new()
            .with_rule(SequenceRule::noop("gates_prebirth", "gates_postbirth"))
            .unwrap(),
    )
}

fn task(
    store: &RunStore,
    source: &MemoryIdentitySource,
    gateway: &MemoryGateway,
    mapper: Arc<SequenceMapper>,
) -> MigrationTask {
    MigrationTask::new(
        store.clone(),
        Arc::new(source.clone()),
        Arc::new(gateway.clone()),
        mapper,
    )
    .with_config(TaskConfig::default().with_chunk_size(10))
}

#[tokio::test]
async fn test_twenty_five_rows_in_chunks_of_ten() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(25);
    let gateway = gateway();
    for identity in source.identities() {
        gateway.subscribe(identity, PREBIRTH, 1, "eng_ZA");
    }

    let outcome = task(&store, &source, &gateway, noop_mapper())
        .run(run_id)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(source.fetches(), vec![10, 10, 5, 0]);
    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.total, Some(25));
    assert_eq!(run.current, 25);
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(store.migrated_identities(run_id).await.unwrap().len(), 25);
}

#[tokio::test]
async fn test_identity_without_subscription_is_skipped_with_error_log() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(1);
    let identity = source.identities()[0];
    let gateway = gateway();

    task(&store, &source, &gateway, noop_mapper())
        .run(run_id)
        .await
        .unwrap();

    let errors: Vec<_> = store
        .list_logs(run_id, 100, 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].message,
        format!(
            "Identity {identity} has no existing subscriptions to gates_prebirth. \
             Not migrating identity."
        )
    );
    assert!(store.migrated_identities(run_id).await.unwrap().is_empty());

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.current, 1);
}

#[tokio::test]
async fn test_single_subscription_is_replaced() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(1);
    let identity = source.identities()[0];
    let gateway = gateway();
    let old = gateway.subscribe(identity, PREBIRTH, 5, "xho_ZA");

    task(&store, &source, &gateway, noop_mapper())
        .run(run_id)
        .await
        .unwrap();

    assert_eq!(gateway.deactivated(), vec![old]);
    let created = gateway.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].identity, identity);
    assert_eq!(created[0].messageset, POSTBIRTH);
    assert_eq!(created[0].initial_sequence_number, 5);
    assert_eq!(created[0].next_sequence_number, 5);
    assert_eq!(created[0].lang, "xho_ZA");
    assert_eq!(created[0].schedule, 7);

    let records = store.migrated_identities(run_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, identity);
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_at_identity_boundary() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(10);
    let gateway = gateway();
    for identity in source.identities() {
        gateway.subscribe(identity, PREBIRTH, 1, "eng_ZA");
    }

    let outcome = task(&store, &source, &gateway, noop_mapper())
        .with_cancellation_check(Arc::new(CancelBefore::new(4)))
        .run(run_id)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.current, 4);

    let migrated: Vec<_> = store
        .migrated_identities(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.identity)
        .collect();
    assert_eq!(migrated, source.identities()[..4].to_vec());
    assert_eq!(source.open_cursors(), 0);
}

#[tokio::test]
async fn test_resume_skips_already_processed_identities() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(10);
    let gateway = gateway();
    for identity in source.identities() {
        gateway.subscribe(identity, PREBIRTH, 1, "eng_ZA");
    }

    task(&store, &source, &gateway, noop_mapper())
        .with_cancellation_check(Arc::new(CancelBefore::new(6)))
        .run(run_id)
        .await
        .unwrap();
    assert!(store.retry(run_id).await.unwrap());

    let outcome = task(&store, &source, &gateway, noop_mapper())
        .run(run_id)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let migrated: Vec<_> = store
        .migrated_identities(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.identity)
        .collect();
    assert_eq!(migrated, source.identities());
    assert_eq!(gateway.created().len(), 10);

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.current, 10);
    assert_eq!(run.total, Some(10));
}

#[tokio::test]
async fn test_missing_mapping_fails_run() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(3);
    let gateway = gateway();
    for identity in source.identities() {
        gateway.subscribe(identity, PREBIRTH, 2, "eng_ZA");
    }

    let outcome = task(&store, &source, &gateway, Arc::new(SequenceMapper::new()))
        .run(run_id)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.current, 0);
    assert!(run.can_be_resumed());

    let last = store.list_logs(run_id, 100, 0).await.unwrap().pop().unwrap();
    assert_eq!(last.level, LogLevel::Error);
    assert_eq!(
        last.message,
        "[no_mapping]: No mapping can be found for messageset gates_prebirth and sequence 2."
    );
}

#[tokio::test]
async fn test_forward_rule_positions() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(3);
    let gateway = gateway();
    let identities = source.identities();
    for (identity, sequence) in identities.iter().zip([0, 1, 12]) {
        gateway.subscribe(*identity, PREBIRTH, sequence, "eng_ZA");
    }
    let mapper = SequenceMapper::new()
        .with_rule(SequenceRule::new(
            "gates_prebirth",
            "gates_postbirth",
            Transform::affine(2, 1, -1),
            Transform::affine(1, 2, 1),
        ))
        .unwrap();

    task(&store, &source, &gateway, Arc::new(mapper))
        .run(run_id)
        .await
        .unwrap();

    let positions: Vec<_> = gateway
        .created()
        .into_iter()
        .map(|sub| sub.next_sequence_number)
        .collect();
    assert_eq!(positions, vec![0, 1, 23]);
}

#[tokio::test]
async fn test_retry_rejected_unless_error_or_cancelled() {
    let (store, run_id) = store_with_run().await;
    assert!(!store.retry(run_id).await.unwrap());

    let source = MemoryIdentitySource::with_count(0);
    task(&store, &source, &gateway(), noop_mapper())
        .run(run_id)
        .await
        .unwrap();
    assert_eq!(store.status(run_id).await.unwrap(), RunStatus::Complete);
    assert!(!store.retry(run_id).await.unwrap());
    assert_eq!(store.status(run_id).await.unwrap(), RunStatus::Complete);

    assert!(matches!(store.get_run(run_id + 1).await, Err(Error::RunNotFound(_))));
}

/// Before the identity at ordinal `at`, an operator cancels and retries the
/// run and a second orchestrator claims it.
struct ReclaimBefore {
    at: usize,
    other: Uuid,
    checks: AtomicUsize,
}

#[async_trait]
impl CancellationCheck for ReclaimBefore {
    async fn should_stop(
        &self,
        store: &RunStore,
        run_id: RunId,
        task_id: Uuid,
    ) -> submap_core::Result<bool> {
        if self.checks.fetch_add(1, Ordering::SeqCst) == self.at {
            assert!(store.cancel(run_id).await?);
            assert!(store.retry(run_id).await?);
            assert!(store.claim(run_id, self.other).await?);
        }
        StatusCheck.should_stop(store, run_id, task_id).await
    }
}

#[tokio::test]
async fn test_orchestrator_stops_once_run_is_claimed_by_another_task() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(6);
    let gateway = gateway();
    for identity in source.identities() {
        gateway.subscribe(identity, PREBIRTH, 1, "eng_ZA");
    }
    let other = Uuid::new_v4();
    let check = ReclaimBefore {
        at: 2,
        other,
        checks: AtomicUsize::new(0),
    };

    let outcome = task(&store, &source, &gateway, noop_mapper())
        .with_cancellation_check(Arc::new(check))
        .run(run_id)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.task_id, Some(other));
    assert_eq!(run.current, 2);
    assert_eq!(run.completed_at, None);
    assert_eq!(store.migrated_identities(run_id).await.unwrap().len(), 2);
    assert_eq!(gateway.created().len(), 2);
    assert_eq!(source.open_cursors(), 0);
}

/// Lets the identity at ordinal `at` through, then cancels the run before
/// it is migrated.
struct CancelDuring {
    at: usize,
    checks: AtomicUsize,
}

#[async_trait]
impl CancellationCheck for CancelDuring {
    async fn should_stop(
        &self,
        store: &RunStore,
        run_id: RunId,
        task_id: Uuid,
    ) -> submap_core::Result<bool> {
        let stop = StatusCheck.should_stop(store, run_id, task_id).await?;
        if self.checks.fetch_add(1, Ordering::SeqCst) == self.at {
            store.cancel(run_id).await?;
        }
        Ok(stop)
    }
}

#[tokio::test]
async fn test_cancel_on_last_identity_is_not_overwritten_by_completion() {
    let (store, run_id) = store_with_run().await;
    let source = MemoryIdentitySource::with_count(3);
    let gateway = gateway();
    for identity in source.identities() {
        gateway.subscribe(identity, PREBIRTH, 1, "eng_ZA");
    }
    let check = CancelDuring {
        at: 2,
        checks: AtomicUsize::new(0),
    };

    let outcome = task(&store, &source, &gateway, noop_mapper())
        .with_cancellation_check(Arc::new(check))
        .run(run_id)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.current, 3);
    assert_eq!(run.completed_at, None);
    assert_eq!(store.migrated_identities(run_id).await.unwrap().len(), 3);

    let logs = store.list_logs(run_id, 100, 0).await.unwrap();
    assert_eq!(logs.last().map(|entry| entry.message.as_str()), Some("Stopping task run"));
    assert!(!logs
        .iter()
        .any(|entry| entry.message.starts_with("Completed processing identities")));
}
