//! Integration tests for the offline queue
//!
//! Covers the queue contract over in-memory storage and a manual clock:
//! - Retry bound and terminal failure
//! - Chronological ordering by event time
//! - Urgency window boundaries
//! - Deduplication, capacity eviction and validation
//! - Persistence across instances, concurrent adds and corrupted records
//! - Offline short-circuit, reconnection auto-flush and listener isolation

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{BridgeError, Clock, InMemoryStorage, ManualClock, StorageProvider};
use chrono::{DateTime, Duration, Utc};
use core_runtime::config::QueuePolicy;
use core_runtime::events::{CoreEvent, EventBus, QueueEvent};
use core_sync::{
    handler_fn, HandlerError, Language, LanguageChange, NetworkMonitor, OfflineQueue,
    OperationHandler, OperationKind, ProcessOutcome, QueueError, QueueItem, QueueItemStatus,
    QueueOperation, RecordingContext, RecordingUpload, SettingsUpdate, QUEUE_KEY_PREFIX,
};
use mockall::mock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    pub Handler {}

    #[async_trait]
    impl OperationHandler for Handler {
        async fn handle(&self, item: &QueueItem) -> Result<(), HandlerError>;
    }
}

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    storage: Arc<InMemoryStorage>,
    clock: Arc<ManualClock>,
    network: Arc<NetworkMonitor>,
}

impl Fixture {
    fn online() -> Self {
        Self::with_network(true)
    }

    fn offline() -> Self {
        Self::with_network(false)
    }

    fn with_network(connected: bool) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            clock: Arc::new(ManualClock::starting_now()),
            network: Arc::new(NetworkMonitor::new(connected)),
        }
    }

    fn queue(&self) -> OfflineQueue {
        self.queue_with(QueuePolicy::default())
    }

    fn queue_with(&self, policy: QueuePolicy) -> OfflineQueue {
        OfflineQueue::new(
            self.storage.clone(),
            Arc::clone(&self.network),
            self.clock.clone(),
            policy,
        )
    }
}

fn recording(id: &str, recorded_at: DateTime<Utc>) -> QueueOperation {
    QueueOperation::RecordingUpload(RecordingUpload {
        recording_id: id.to_string(),
        audio_uri: format!("file:///recordings/{}.m4a", id),
        duration_secs: 42.0,
        recorded_at,
        context: RecordingContext::PatientVisit,
        patient_ref: Some("patient-7".to_string()),
        metadata: json!({"ward": "3F"}),
    })
}

fn succeeding() -> Arc<dyn OperationHandler> {
    handler_fn(|_| async { Ok(()) })
}

fn recording_ids(items: &[QueueItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| match &item.operation {
            QueueOperation::RecordingUpload(upload) => upload.recording_id.clone(),
            other => other.dedup_key(),
        })
        .collect()
}

// ============================================================================
// Retry bound
// ============================================================================

#[core_async::test]
async fn test_always_failing_item_fails_after_three_attempts() {
    let fixture = Fixture::online();
    let queue = fixture.queue();

    let mut handler = MockHandler::new();
    handler
        .expect_handle()
        .times(3)
        .returning(|_| Err(HandlerError::Timeout("upload timed out".to_string())));
    queue.register_handler(OperationKind::RecordingUpload, Arc::new(handler));

    let id = queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    for expected in 1..=2 {
        let result = queue.process_item(id).await;
        assert!(matches!(
            result.outcome,
            ProcessOutcome::Retrying { retry_count, .. } if retry_count == expected
        ));
    }

    let third = queue.process_item(id).await;
    assert!(matches!(
        third.outcome,
        ProcessOutcome::Failed { retry_count: 3, .. }
    ));

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.retry_count, 3);
    assert_eq!(
        item.last_error.as_deref(),
        Some("Request timed out: upload timed out")
    );

    // Fourth attempt never reaches the handler
    let fourth = queue.process_item(id).await;
    assert_eq!(
        fourth.outcome,
        ProcessOutcome::RetryLimitReached { retry_count: 3 }
    );
    assert!(fourth.error().unwrap().contains("max retry"));
}

#[core_async::test]
async fn test_failed_items_are_skipped_by_process_queue() {
    let fixture = Fixture::online();
    let queue = fixture.queue_with(QueuePolicy::default().with_max_retries(1));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    queue.register_handler(
        OperationKind::RecordingUpload,
        handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::Server { status: 503, message: "unavailable".to_string() }) }
        }),
    );

    queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    let first = queue.process_queue().await;
    assert!(matches!(first[0].outcome, ProcessOutcome::Failed { .. }));

    let second = queue.process_queue().await;
    assert!(second.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_pending_count().await.unwrap(), 1);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
}

#[core_async::test]
async fn test_success_removes_item_from_storage() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    queue.register_handler(OperationKind::RecordingUpload, succeeding());

    let id = queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();
    assert_eq!(fixture.storage.len().await, 1);

    let results = queue.process_queue().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());
    assert_eq!(results[0].item_id, id);

    assert!(queue.get_item(id).await.unwrap().is_none());
    assert!(fixture.storage.is_empty().await);
}

#[core_async::test]
async fn test_panicking_handler_counts_as_failure() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    queue.register_handler(
        OperationKind::RecordingUpload,
        handler_fn(|item: QueueItem| async move {
            if item.retry_count == 0 {
                panic!("decoder crashed");
            }
            Ok(())
        }),
    );

    let id = queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    let result = queue.process_item(id).await;
    assert!(matches!(
        result.outcome,
        ProcessOutcome::Retrying { retry_count: 1, .. }
    ));
    assert!(result.error().unwrap().contains("handler aborted"));
}

#[core_async::test]
async fn test_missing_handler_defers_without_consuming_retry() {
    let fixture = Fixture::online();
    let queue = fixture.queue();

    let id = queue
        .add_to_queue(QueueOperation::LanguageChange(LanguageChange {
            language: Language::Ja,
        }))
        .await
        .unwrap();

    let results = queue.process_queue().await;
    assert!(matches!(results[0].outcome, ProcessOutcome::Deferred { .. }));

    let item = queue.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 0);
    assert!(item.is_pending());
}

// ============================================================================
// Ordering and urgency
// ============================================================================

#[core_async::test]
async fn test_queue_is_ordered_by_recording_time() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    let t = fixture.clock.now() - Duration::minutes(5);

    queue
        .add_to_queue(recording("t+30", t + Duration::seconds(30)))
        .await
        .unwrap();
    queue.add_to_queue(recording("t", t)).await.unwrap();
    queue
        .add_to_queue(recording("t+10", t + Duration::seconds(10)))
        .await
        .unwrap();

    let items = queue.get_queue().await.unwrap();
    assert_eq!(recording_ids(&items), vec!["t", "t+10", "t+30"]);
}

#[core_async::test]
async fn test_process_queue_follows_chronological_order() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    let t = fixture.clock.now() - Duration::hours(1);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    queue.register_handler(
        OperationKind::RecordingUpload,
        handler_fn(move |item: QueueItem| {
            sink.lock().push(item.dedup_key.clone());
            async { Ok(()) }
        }),
    );

    for (id, offset) in [("late", 20), ("early", 0), ("middle", 10)] {
        queue
            .add_to_queue(recording(id, t + Duration::seconds(offset)))
            .await
            .unwrap();
    }

    queue.process_queue().await;
    assert_eq!(
        *seen.lock(),
        vec![
            "recording_upload:early",
            "recording_upload:middle",
            "recording_upload:late"
        ]
    );
}

#[core_async::test]
async fn test_equal_timestamps_keep_insertion_order() {
    let fixture = Fixture::online();
    let queue = fixture.queue();

    queue
        .add_to_queue(QueueOperation::SettingsUpdate(SettingsUpdate {
            key: "font_size".to_string(),
            value: json!(18),
        }))
        .await
        .unwrap();
    queue
        .add_to_queue(QueueOperation::SettingsUpdate(SettingsUpdate {
            key: "theme".to_string(),
            value: json!("dark"),
        }))
        .await
        .unwrap();

    let items = queue.get_queue().await.unwrap();
    assert_eq!(
        recording_ids(&items),
        vec!["settings_update:font_size", "settings_update:theme"]
    );
}

#[core_async::test]
async fn test_urgency_window_boundary() {
    let fixture = Fixture::online();
    let queue = fixture.queue();

    queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    fixture
        .clock
        .advance(Duration::hours(24) - Duration::seconds(1));
    assert!(queue.get_urgent_items().await.unwrap().is_empty());

    fixture.clock.advance(Duration::seconds(2));
    assert_eq!(queue.get_urgent_items().await.unwrap().len(), 1);
    assert_eq!(queue.stats().await.unwrap().urgent, 1);
}

#[core_async::test]
async fn test_oldest_pending_age() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    assert!(queue.get_oldest_pending_age().await.unwrap().is_none());

    let now = fixture.clock.now();
    queue
        .add_to_queue(recording("recent", now - Duration::minutes(5)))
        .await
        .unwrap();
    queue
        .add_to_queue(recording("older", now - Duration::hours(2)))
        .await
        .unwrap();

    assert_eq!(
        queue.get_oldest_pending_age().await.unwrap(),
        Some(Duration::hours(2))
    );
}

// ============================================================================
// Enqueue rules
// ============================================================================

#[core_async::test]
async fn test_duplicate_operation_returns_existing_id() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    let now = fixture.clock.now();

    let first = queue.add_to_queue(recording("rec-1", now)).await.unwrap();
    let second = queue.add_to_queue(recording("rec-1", now)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(queue.get_pending_count().await.unwrap(), 1);
}

#[core_async::test]
async fn test_invalid_operations_are_rejected() {
    let fixture = Fixture::online();
    let queue = fixture.queue();

    let mut zero_length = recording("rec-1", fixture.clock.now());
    if let QueueOperation::RecordingUpload(upload) = &mut zero_length {
        upload.duration_secs = 0.0;
    }
    assert!(matches!(
        queue.add_to_queue(zero_length).await,
        Err(QueueError::Validation(_))
    ));

    let bad_context = QueueOperation::from_json(
        "recording_upload",
        json!({
            "recordingId": "rec-2",
            "audioUri": "file:///rec-2.m4a",
            "durationSecs": 10.0,
            "recordedAt": "2026-01-05T09:00:00Z",
            "context": "night_shift"
        }),
    );
    assert!(matches!(bad_context, Err(QueueError::Validation(_))));

    assert_eq!(queue.get_pending_count().await.unwrap(), 0);
}

#[core_async::test]
async fn test_capacity_evicts_oldest_but_never_new_item() {
    let fixture = Fixture::online();
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let queue = fixture
        .queue_with(QueuePolicy::default().with_capacity(2))
        .with_events(bus);
    let now = fixture.clock.now();

    queue
        .add_to_queue(recording("a", now - Duration::minutes(10)))
        .await
        .unwrap();
    queue
        .add_to_queue(recording("b", now - Duration::minutes(5)))
        .await
        .unwrap();
    // Older than everything queued, still kept
    let newest = queue
        .add_to_queue(recording("c", now - Duration::hours(1)))
        .await
        .unwrap();

    let items = queue.get_queue().await.unwrap();
    assert_eq!(recording_ids(&items), vec!["c", "b"]);
    assert_eq!(items[0].id, newest);
    assert_eq!(fixture.storage.len().await, 2);

    let mut evicted = 0;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Queue(QueueEvent::ItemEvicted { .. }) = event {
            evicted += 1;
        }
    }
    assert_eq!(evicted, 1);
}

/// In-memory storage whose deletes can be switched off
#[derive(Default)]
struct StuckDeletes {
    inner: InMemoryStorage,
    failing: AtomicBool,
}

#[async_trait]
impl StorageProvider for StuckDeletes {
    async fn get(&self, key: &str) -> BridgeResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> BridgeResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::Storage("device busy".to_string()));
        }
        self.inner.remove(key).await
    }

    async fn get_all_keys(&self) -> BridgeResult<Vec<String>> {
        self.inner.get_all_keys().await
    }
}

#[core_async::test]
async fn test_failed_eviction_keeps_item_until_delete_succeeds() {
    let fixture = Fixture::online();
    let storage = Arc::new(StuckDeletes::default());
    let open = || {
        OfflineQueue::new(
            storage.clone(),
            Arc::clone(&fixture.network),
            fixture.clock.clone(),
            QueuePolicy::default().with_capacity(1),
        )
    };
    let now = fixture.clock.now();

    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let queue = open().with_events(bus);
    queue.add_to_queue(recording("a", now)).await.unwrap();

    storage.failing.store(true, Ordering::SeqCst);
    queue.add_to_queue(recording("b", now)).await.unwrap();

    // Memory and storage agree on both items
    assert_eq!(recording_ids(&queue.get_queue().await.unwrap()), vec!["a", "b"]);
    let reopened = open();
    assert_eq!(reopened.load().await.unwrap().loaded, 2);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, CoreEvent::Queue(QueueEvent::ItemEvicted { .. })));
    }

    storage.failing.store(false, Ordering::SeqCst);
    queue.add_to_queue(recording("c", now)).await.unwrap();

    assert_eq!(recording_ids(&queue.get_queue().await.unwrap()), vec!["c"]);
    assert_eq!(storage.inner.len().await, 1);
}

// ============================================================================
// Persistence
// ============================================================================

#[core_async::test]
async fn test_items_survive_a_new_queue_instance() {
    let fixture = Fixture::online();
    let now = fixture.clock.now();

    let id = {
        let queue = fixture.queue();
        queue.add_to_queue(recording("rec-1", now)).await.unwrap()
    };

    let reopened = fixture.queue();
    let report = reopened.load().await.unwrap();
    assert_eq!(report.loaded, 1);
    assert!(report.corrupted_keys.is_empty());

    let item = reopened.get_item(id).await.unwrap().unwrap();
    assert_eq!(item.operation, recording("rec-1", now));

    // Sequence continues after reload
    let next = reopened
        .add_to_queue(recording("rec-2", now))
        .await
        .unwrap();
    let items = reopened.get_queue().await.unwrap();
    assert_eq!(items.last().unwrap().id, next);
}

#[core_async::test]
async fn test_concurrent_adds_are_all_persisted() {
    let fixture = Fixture::online();
    let now = fixture.clock.now();
    let queue = Arc::new(fixture.queue());

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let queue = Arc::clone(&queue);
            core_async::spawn(async move {
                queue
                    .add_to_queue(recording(&format!("rec-{}", i), now))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(queue.get_pending_count().await.unwrap(), 20);

    let reopened = fixture.queue();
    assert_eq!(reopened.load().await.unwrap().loaded, 20);
    let mut ids = recording_ids(&reopened.get_queue().await.unwrap());
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[core_async::test]
async fn test_corrupted_records_are_dropped_on_load() {
    let fixture = Fixture::online();
    fixture
        .queue()
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    let garbage_key = format!("{}item/garbage", QUEUE_KEY_PREFIX);
    fixture
        .storage
        .set(&garbage_key, "{\"id\": truncated")
        .await
        .unwrap();

    let queue = fixture.queue();
    let report = queue.load().await.unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(report.corrupted_keys, vec![garbage_key.clone()]);
    assert!(fixture.storage.get(&garbage_key).await.unwrap().is_none());
}

#[core_async::test]
async fn test_scoped_queues_do_not_share_items() {
    let fixture = Fixture::online();
    let nurse = fixture.queue().with_scope("nurse");
    let doctor = fixture.queue().with_scope("doctor");

    nurse
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    assert_eq!(nurse.get_pending_count().await.unwrap(), 1);
    assert_eq!(doctor.get_pending_count().await.unwrap(), 0);
}

#[core_async::test]
async fn test_discard_item_removes_failed_item() {
    let fixture = Fixture::online();
    let queue = fixture.queue_with(QueuePolicy::default().with_max_retries(1));
    queue.register_handler(
        OperationKind::RecordingUpload,
        handler_fn(|_| async { Err(HandlerError::Rejected("bad audio".to_string())) }),
    );

    let id = queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();
    queue.process_item(id).await;

    let discarded = queue.discard_item(id).await.unwrap();
    assert!(discarded.is_failed());
    assert!(fixture.storage.is_empty().await);
    assert!(matches!(
        queue.discard_item(id).await,
        Err(QueueError::ItemNotFound { .. })
    ));
}

// ============================================================================
// Connectivity
// ============================================================================

#[core_async::test]
async fn test_process_queue_is_noop_while_offline() {
    let fixture = Fixture::offline();
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let queue = fixture.queue().with_events(bus);

    let mut handler = MockHandler::new();
    handler.expect_handle().never();
    queue.register_handler(OperationKind::RecordingUpload, Arc::new(handler));

    queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    assert!(queue.process_queue().await.is_empty());
    assert_eq!(queue.get_pending_count().await.unwrap(), 1);

    let mut skipped = false;
    while let Ok(event) = events.try_recv() {
        if event == CoreEvent::Queue(QueueEvent::FlushSkippedOffline { pending_count: 1 }) {
            skipped = true;
        }
    }
    assert!(skipped);
}

#[core_async::test]
async fn test_flush_stops_when_connection_drops() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    let network = Arc::clone(&fixture.network);
    queue.register_handler(
        OperationKind::RecordingUpload,
        handler_fn(move |_| {
            network.report(false);
            async { Err(HandlerError::Offline("connection reset".to_string())) }
        }),
    );

    let now = fixture.clock.now();
    queue
        .add_to_queue(recording("a", now - Duration::seconds(2)))
        .await
        .unwrap();
    queue.add_to_queue(recording("b", now)).await.unwrap();

    let results = queue.process_queue().await;
    assert_eq!(results.len(), 1);

    let items = queue.get_queue().await.unwrap();
    assert_eq!(items[0].retry_count, 1);
    assert_eq!(items[1].retry_count, 0);
}

#[core_async::test]
async fn test_reconnection_triggers_auto_flush() {
    let fixture = Fixture::offline();
    let queue = Arc::new(fixture.queue());
    queue.register_handler(OperationKind::RecordingUpload, succeeding());
    let _auto_flush = queue.start_auto_flush();

    queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();

    fixture.network.report(true);

    core_async::time::timeout(core_async::Duration::from_secs(2), async {
        while queue.get_pending_count().await.unwrap() > 0 {
            core_async::task::yield_now().await;
        }
    })
    .await
    .expect("queue flushed after reconnection");
}

// ============================================================================
// Notifications
// ============================================================================

#[core_async::test]
async fn test_queue_change_listeners_receive_snapshots() {
    let fixture = Fixture::online();
    let queue = fixture.queue();
    queue.register_handler(OperationKind::RecordingUpload, succeeding());

    let snapshots = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    queue.on_queue_change(Arc::new(move |items: &Vec<QueueItem>| {
        sink.lock().push(items.len());
    }));
    // A panicking listener must not break the queue or other listeners
    queue.on_queue_change(Arc::new(|_: &Vec<QueueItem>| panic!("listener bug")));

    let now = fixture.clock.now();
    queue.add_to_queue(recording("a", now)).await.unwrap();
    queue.add_to_queue(recording("b", now)).await.unwrap();
    queue.process_queue().await;

    assert_eq!(*snapshots.lock(), vec![1, 2, 1, 0]);
}

#[core_async::test]
async fn test_unsubscribed_listener_is_not_called() {
    let fixture = Fixture::online();
    let queue = fixture.queue();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscription = queue.on_queue_change(Arc::new(move |_: &Vec<QueueItem>| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    subscription.unsubscribe();

    queue
        .add_to_queue(recording("rec-1", fixture.clock.now()))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[core_async::test]
async fn test_flush_emits_summary_event() {
    let fixture = Fixture::online();
    let bus = EventBus::new(32);
    let mut events = bus.subscribe();
    let queue = fixture.queue().with_events(bus);
    queue.register_handler(OperationKind::RecordingUpload, succeeding());

    let now = fixture.clock.now();
    queue.add_to_queue(recording("a", now)).await.unwrap();
    queue.add_to_queue(recording("b", now)).await.unwrap();
    queue.process_queue().await;

    let mut summary = None;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Queue(e @ QueueEvent::FlushCompleted { .. }) = event {
            summary = Some(e);
        }
    }
    assert_eq!(
        summary,
        Some(QueueEvent::FlushCompleted {
            attempted: 2,
            succeeded: 2,
            failed: 0
        })
    );
}
