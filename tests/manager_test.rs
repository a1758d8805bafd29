//! Integration tests for the command queue manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cmdq::event::{HandleLifecycle, LifecycleEvent};
use cmdq::registry::KindRegistry;
use cmdq::store::{CommandStore, MemoryCommandStore};
use cmdq::{Command, CommandId, CommandModel, CommandQueueManager, Error, Priority, Status, Trigger};
use serde_json::json;

fn test_manager() -> (Arc<MemoryCommandStore>, CommandQueueManager) {
    let store = Arc::new(MemoryCommandStore::new());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    (store, manager)
}

fn refresh(series_id: i64) -> Command {
    Command::new("RefreshSeries").params(json!({"series_id": series_id}))
}

// ---------------------------------------------------------------------------
// End-to-end: push → pop → completed → get
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_pop_complete_get() {
    let (_store, manager) = test_manager();

    let pushed = manager
        .push(Command::new("Backup"), Priority::High, Trigger::Manual)
        .await
        .unwrap();
    assert_eq!(pushed.status, Status::Queued);
    assert_eq!(pushed.name, "Backup");
    assert_eq!(pushed.priority, Priority::High);
    assert_eq!(pushed.trigger, Trigger::Manual);
    assert!(pushed.started_at.is_none());

    let popped = manager.pop().await.unwrap().expect("should pop");
    assert_eq!(popped.id, pushed.id);
    assert_eq!(popped.status, Status::Started);
    assert!(popped.started_at.is_some());

    manager.completed(&popped).await.unwrap();

    let done = manager.get(pushed.id).await.unwrap();
    assert_eq!(done.status, Status::Completed);
    assert!(done.duration_ms.unwrap() >= 0);
    assert!(done.exception.is_none());
    assert_eq!(manager.cached_len(), 0);
    assert!(manager.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn pop_returns_none_when_queue_empty() {
    let (_store, manager) = test_manager();
    assert!(manager.pop().await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_push_returns_existing_record() {
    let (store, manager) = test_manager();

    let first = manager
        .push(refresh(7), Priority::Normal, Trigger::Scheduled)
        .await
        .unwrap();
    let second = manager
        .push(
            refresh(7).last_execution_time(Some(Utc::now())),
            Priority::High,
            Trigger::Manual,
        )
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.priority, Priority::Normal, "existing record is returned unchanged");
    assert_eq!(store.len(), 1, "only one durable insert");
}

#[tokio::test]
async fn duplicate_of_started_command_is_suppressed() {
    let (store, manager) = test_manager();

    let first = manager
        .push(refresh(7), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();
    assert_eq!(started.id, first.id);

    let again = manager
        .push(refresh(7), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.status, Status::Started);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn different_params_are_not_deduplicated() {
    let (store, manager) = test_manager();

    let a = manager
        .push(refresh(7), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let b = manager
        .push(refresh(8), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn finished_command_can_run_again() {
    let (store, manager) = test_manager();

    let first = manager
        .push(refresh(7), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();
    manager.completed(&started).await.unwrap();

    let rerun = manager
        .push(refresh(7), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    assert_ne!(rerun.id, first.id);
    assert_eq!(rerun.status, Status::Queued);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn concurrent_duplicate_pushes_create_one_record() {
    let (store, manager) = test_manager();
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager
                .push(refresh(1), Priority::Normal, Trigger::Unspecified)
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(store.len(), 1);
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop_orders_by_priority_then_arrival() {
    let (_store, manager) = test_manager();

    let p1 = manager
        .push(Command::new("P1"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let p2 = manager
        .push(Command::new("P2"), Priority::High, Trigger::Unspecified)
        .await
        .unwrap();
    let p3 = manager
        .push(Command::new("P3"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();

    let order: Vec<CommandId> = [
        manager.pop().await.unwrap().unwrap().id,
        manager.pop().await.unwrap().unwrap().id,
        manager.pop().await.unwrap().unwrap().id,
    ]
    .to_vec();
    assert_eq!(order, vec![p2.id, p1.id, p3.id]);
}

#[tokio::test]
async fn low_priority_runs_last() {
    let (_store, manager) = test_manager();

    let low = manager
        .push(Command::new("Low"), Priority::Low, Trigger::Unspecified)
        .await
        .unwrap();
    let normal = manager
        .push(Command::new("Normal"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();

    assert_eq!(manager.pop().await.unwrap().unwrap().id, normal.id);
    assert_eq!(manager.pop().await.unwrap().unwrap().id, low.id);
}

// ---------------------------------------------------------------------------
// Atomic claim
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pops_claim_each_record_once() {
    let (_store, manager) = test_manager();
    let manager = Arc::new(manager);

    const QUEUED: usize = 5;
    const CALLERS: usize = 20;

    for i in 0..QUEUED {
        manager
            .push(
                Command::new("Index").params(json!({"n": i})),
                Priority::Normal,
                Trigger::Unspecified,
            )
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move { manager.pop().await.unwrap() }));
    }

    let mut claimed = Vec::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(model) => claimed.push(model.id),
            None => empty += 1,
        }
    }

    let distinct: HashSet<CommandId> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), QUEUED);
    assert_eq!(distinct.len(), QUEUED);
    assert_eq!(empty, CALLERS - QUEUED);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_fields_are_set_exactly_at_finish() {
    let (_store, manager) = test_manager();

    let queued = manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let stored = manager.get(queued.id).await.unwrap();
    assert_eq!(stored.status, Status::Queued);
    assert!(stored.started_at.is_none());
    assert!(stored.ended_at.is_none());
    assert!(stored.duration_ms.is_none());

    let started = manager.pop().await.unwrap().unwrap();
    let stored = manager.get(queued.id).await.unwrap();
    assert_eq!(stored.status, Status::Started);
    assert_eq!(stored.started_at, started.started_at);
    assert!(stored.ended_at.is_none());
    assert!(stored.duration_ms.is_none());

    manager.completed(&started).await.unwrap();
    let stored = manager.get(queued.id).await.unwrap();
    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.started_at, started.started_at);
    let ended = stored.ended_at.expect("ended_at set");
    let expected = (ended - stored.started_at.unwrap()).num_milliseconds();
    assert_eq!(stored.duration_ms, Some(expected));
}

#[tokio::test]
async fn failed_persists_error_detail() {
    let (_store, manager) = test_manager();

    manager
        .push(Command::new("Import"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();

    manager.failed(&started, "disk full").await.unwrap();

    let stored = manager.get(started.id).await.unwrap();
    assert_eq!(stored.status, Status::Failed);
    assert_eq!(stored.exception.as_deref(), Some("disk full"));
    assert!(stored.duration_ms.is_some());
    assert_eq!(manager.cached_len(), 0);
}

#[tokio::test]
async fn completing_a_queued_command_is_inconsistent() {
    let (_store, manager) = test_manager();

    let queued = manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();

    let err = manager.completed(&queued).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InconsistentState {
            status: Status::Queued,
            ..
        }
    ));

    // Still queued and poppable
    assert_eq!(manager.pop().await.unwrap().unwrap().id, queued.id);
}

#[tokio::test]
async fn finishing_twice_is_inconsistent() {
    let (_store, manager) = test_manager();

    manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();
    manager.completed(&started).await.unwrap();

    let err = manager.failed(&started, "late").await.unwrap_err();
    assert!(matches!(
        err,
        Error::InconsistentState {
            status: Status::Completed,
            ..
        }
    ));
    assert_eq!(
        manager.get(started.id).await.unwrap().status,
        Status::Completed
    );
}

/// Delays terminal updates so two reports for one record overlap.
#[derive(Default)]
struct SlowFinishStore {
    inner: MemoryCommandStore,
}

#[async_trait]
impl CommandStore for SlowFinishStore {
    async fn insert(&self, record: &CommandModel) -> cmdq::Result<CommandId> {
        self.inner.insert(record).await
    }

    async fn update(&self, record: &CommandModel) -> cmdq::Result<()> {
        if record.status.is_terminal() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.update(record).await
    }

    async fn get(&self, id: CommandId) -> cmdq::Result<CommandModel> {
        self.inner.get(id).await
    }

    async fn list_queued(&self) -> cmdq::Result<Vec<CommandModel>> {
        self.inner.list_queued().await
    }

    async fn list_started(&self) -> cmdq::Result<Vec<CommandModel>> {
        self.inner.list_started().await
    }

    async fn mark_all_started_as_orphaned(&self) -> cmdq::Result<u64> {
        self.inner.mark_all_started_as_orphaned().await
    }
}

#[tokio::test]
async fn concurrent_terminal_reports_accept_exactly_one() {
    let store = Arc::new(SlowFinishStore::default());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());

    manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();

    let (completed, failed) = tokio::join!(
        manager.completed(&started),
        manager.failed(&started, "late")
    );

    let (winner, loser) = match (completed, failed) {
        (Ok(()), Err(err)) => (Status::Completed, err),
        (Err(err), Ok(())) => (Status::Failed, err),
        other => panic!("expected exactly one accepted report, got {other:?}"),
    };
    assert!(matches!(loser, Error::InconsistentState { .. }));
    assert_eq!(manager.get(started.id).await.unwrap().status, winner);
    assert_eq!(manager.cached_len(), 0);
}

#[tokio::test]
async fn get_started_lists_claimed_commands() {
    let (_store, manager) = test_manager();

    manager
        .push(Command::new("A"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    manager
        .push(Command::new("B"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();

    let listed = manager.get_started().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, started.id);
}

#[tokio::test]
async fn get_unknown_id_is_not_found() {
    let (_store, manager) = test_manager();
    assert!(matches!(
        manager.get(CommandId(99)).await,
        Err(Error::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_command_is_rejected_without_writing() {
    let (store, manager) = test_manager();

    let err = manager
        .push(Command::new(""), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = manager
        .push(
            Command::new("Backup").params(json!("not an object")),
            Priority::Normal,
            Trigger::Unspecified,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert!(store.is_empty());
    assert_eq!(manager.cached_len(), 0);
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn messages_are_attached_on_get_and_cleared_on_finish() {
    let (store, manager) = test_manager();

    manager
        .push(Command::new("Scan"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();

    manager.set_message(&started, "scanning 1/10");
    manager.set_message(&started, "scanning 2/10");
    let during = manager.get(started.id).await.unwrap();
    assert_eq!(during.message.as_deref(), Some("scanning 2/10"));

    // The durable record is untouched by progress messages
    let persisted = store.get(started.id).await.unwrap();
    assert!(persisted.message.is_none());
    assert_eq!(persisted.status, Status::Started);

    manager.completed(&started).await.unwrap();

    let after = manager.get(started.id).await.unwrap();
    assert!(after.message.is_none());
    assert_eq!(after.name, started.name);
    assert_eq!(after.priority, started.priority);
    assert_eq!(after.trigger, started.trigger);
    assert_eq!(after.queued_at, started.queued_at);
    assert_eq!(after.started_at, started.started_at);
    assert_eq!(after.body.params, started.body.params);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_orphans_started_and_reloads_queued() {
    let store = Arc::new(MemoryCommandStore::new());

    let queued = CommandModel::queued(Command::new("Queued"), Priority::Normal, Trigger::Unspecified);
    let queued_id = store.insert(&queued).await.unwrap();

    let mut started =
        CommandModel::queued(Command::new("Started"), Priority::High, Trigger::Unspecified);
    started.status = Status::Started;
    started.started_at = Some(Utc::now());
    let started_id = store.insert(&started).await.unwrap();

    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    manager
        .handle(LifecycleEvent::ApplicationStarted)
        .await
        .unwrap();

    let orphan = manager.get(started_id).await.unwrap();
    assert_eq!(orphan.status, Status::Orphaned);
    assert!(orphan.ended_at.is_some());
    assert_eq!(manager.cached_len(), 1);

    let popped = manager.pop().await.unwrap().expect("queued record survives restart");
    assert_eq!(popped.id, queued_id);
    assert!(manager.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn recovery_runs_once() {
    let store = Arc::new(MemoryCommandStore::new());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    manager
        .handle(LifecycleEvent::ApplicationStarted)
        .await
        .unwrap();

    // Started after recovery: a second startup signal must not orphan it.
    manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();

    manager
        .handle(LifecycleEvent::ApplicationStarted)
        .await
        .unwrap();
    assert_eq!(
        manager.get(started.id).await.unwrap().status,
        Status::Started
    );
}

#[tokio::test]
async fn first_pop_triggers_recovery() {
    let store = Arc::new(MemoryCommandStore::new());
    let queued = CommandModel::queued(Command::new("Leftover"), Priority::Low, Trigger::Scheduled);
    let id = store.insert(&queued).await.unwrap();

    let manager = CommandQueueManager::new(store, KindRegistry::empty());
    assert_eq!(manager.pop().await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn push_before_recovery_deduplicates_against_stored_queue() {
    let store = Arc::new(MemoryCommandStore::new());
    let leftover = CommandModel::queued(refresh(1), Priority::Normal, Trigger::Scheduled);
    let leftover_id = store.insert(&leftover).await.unwrap();

    // Fresh manager: nothing cached until recovery runs
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    let pushed = manager
        .push(refresh(1), Priority::Normal, Trigger::Manual)
        .await
        .unwrap();

    assert_eq!(pushed.id, leftover_id);
    assert_eq!(store.list_queued().await.unwrap().len(), 1);
    assert_eq!(manager.pop().await.unwrap().unwrap().id, leftover_id);
    assert!(manager.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn orphaned_records_are_not_reloaded() {
    let store = Arc::new(MemoryCommandStore::new());
    let mut started = CommandModel::queued(Command::new("Lost"), Priority::Normal, Trigger::Unspecified);
    started.status = Status::Started;
    started.started_at = Some(Utc::now());
    store.insert(&started).await.unwrap();

    // Two process lifetimes over the same store
    let first = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    first.ensure_recovered().await.unwrap();
    let second = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    second.ensure_recovered().await.unwrap();

    assert_eq!(second.cached_len(), 0);
    assert!(second.pop().await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Work-ready signal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_signals_work_ready() {
    let (_store, manager) = test_manager();
    manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), manager.work_ready())
        .await
        .expect("push should signal waiting dispatchers");
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

/// Wraps the memory store and fails writes on demand.
struct FlakyStore {
    inner: MemoryCommandStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryCommandStore::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> cmdq::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CommandStore for FlakyStore {
    async fn insert(&self, record: &CommandModel) -> cmdq::Result<CommandId> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn update(&self, record: &CommandModel) -> cmdq::Result<()> {
        self.check()?;
        self.inner.update(record).await
    }

    async fn get(&self, id: CommandId) -> cmdq::Result<CommandModel> {
        self.inner.get(id).await
    }

    async fn list_queued(&self) -> cmdq::Result<Vec<CommandModel>> {
        self.inner.list_queued().await
    }

    async fn list_started(&self) -> cmdq::Result<Vec<CommandModel>> {
        self.inner.list_started().await
    }

    async fn mark_all_started_as_orphaned(&self) -> cmdq::Result<u64> {
        self.check()?;
        self.inner.mark_all_started_as_orphaned().await
    }
}

#[tokio::test]
async fn failed_insert_leaves_cache_untouched() {
    let store = Arc::new(FlakyStore::new());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    manager.ensure_recovered().await.unwrap();

    store.set_failing(true);
    let err = manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    assert_eq!(manager.cached_len(), 0);

    store.set_failing(false);
    let model = manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    assert_eq!(model.status, Status::Queued);
}

#[tokio::test]
async fn failed_claim_keeps_command_queued() {
    let store = Arc::new(FlakyStore::new());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());
    manager.ensure_recovered().await.unwrap();

    let queued = manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();

    store.set_failing(true);
    assert!(matches!(
        manager.pop().await,
        Err(Error::StoreUnavailable(_))
    ));
    assert_eq!(manager.get(queued.id).await.unwrap().status, Status::Queued);

    store.set_failing(false);
    let popped = manager.pop().await.unwrap().expect("still claimable");
    assert_eq!(popped.id, queued.id);
}

#[tokio::test]
async fn failed_completion_keeps_command_started() {
    let store = Arc::new(FlakyStore::new());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());

    manager
        .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
        .await
        .unwrap();
    let started = manager.pop().await.unwrap().unwrap();
    manager.set_message(&started, "almost");

    store.set_failing(true);
    assert!(matches!(
        manager.completed(&started).await,
        Err(Error::StoreUnavailable(_))
    ));
    assert_eq!(manager.cached_len(), 1);
    assert_eq!(
        manager.get(started.id).await.unwrap().message.as_deref(),
        Some("almost")
    );

    store.set_failing(false);
    manager.completed(&started).await.unwrap();
    assert_eq!(manager.cached_len(), 0);
}

#[tokio::test]
async fn failed_recovery_is_retried() {
    let store = Arc::new(FlakyStore::new());
    let manager = CommandQueueManager::new(store.clone(), KindRegistry::empty());

    store.set_failing(true);
    assert!(manager.pop().await.is_err());
    assert!(matches!(
        manager
            .push(Command::new("Backup"), Priority::Normal, Trigger::Unspecified)
            .await,
        Err(Error::StoreUnavailable(_))
    ));
    assert_eq!(manager.cached_len(), 0);

    store.set_failing(false);
    assert!(manager.pop().await.unwrap().is_none());
}
