//! End-to-end tests for the core service façade over in-memory bridges

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    InMemorySecureStore, InMemoryStorage, ManualClock, NetworkChangeStream, NetworkInfo,
    NetworkStatusSource, StorageProvider,
};
use chrono::Utc;
use core_cache::{user_scope, CacheCategory};
use core_runtime::events::QueueEvent;
use core_service::{CoreConfig, CoreError, CoreEvent, CoreService};
use core_sync::{
    handler_fn, OperationKind, QueueOperation, RecordingContext, RecordingUpload,
    QUEUE_KEY_PREFIX,
};
use mockall::mock;
use serde_json::json;
use std::sync::Arc;

mock! {
    pub Source {}

    #[async_trait]
    impl NetworkStatusSource for Source {
        async fn get_network_info(&self) -> BridgeResult<NetworkInfo>;
        async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>>;
    }
}

struct ClosedStream;

#[async_trait]
impl NetworkChangeStream for ClosedStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        None
    }
}

async fn core_over(storage: Arc<InMemoryStorage>) -> CoreService {
    let config = CoreConfig::builder()
        .storage(storage)
        .secure_store(Arc::new(InMemorySecureStore::new()))
        .clock(Arc::new(ManualClock::starting_now()))
        .build()
        .unwrap();
    CoreService::new(config).await.unwrap()
}

fn upload(id: &str) -> QueueOperation {
    QueueOperation::RecordingUpload(RecordingUpload {
        recording_id: id.to_string(),
        audio_uri: format!("file:///recordings/{}.m4a", id),
        duration_secs: 95.5,
        recorded_at: Utc::now(),
        context: RecordingContext::Handover,
        patient_ref: None,
        metadata: serde_json::Value::Null,
    })
}

#[core_async::test]
async fn test_sessions_are_isolated_per_user() {
    let storage = Arc::new(InMemoryStorage::new());
    let core = core_over(storage.clone()).await;

    let nurse = core.open_session("nurse-1").await.unwrap();
    let doctor = core.open_session("doctor-1").await.unwrap();
    assert_ne!(nurse.scope(), doctor.scope());

    nurse
        .cache()
        .put(CacheCategory::Patients, "p-1", &json!({"name": "Sato"}))
        .await
        .unwrap();
    nurse.queue().add_to_queue(upload("rec-1")).await.unwrap();

    assert!(doctor
        .cache()
        .get::<serde_json::Value>(CacheCategory::Patients, "p-1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(doctor.queue().get_pending_count().await.unwrap(), 0);

    // The raw user id never appears in storage keys
    let keys = storage.snapshot().await;
    assert!(keys.keys().all(|key| !key.contains("nurse-1")));
}

#[core_async::test]
async fn test_empty_user_id_is_rejected() {
    let core = core_over(Arc::new(InMemoryStorage::new())).await;

    assert!(matches!(
        core.open_session("  ").await,
        Err(CoreError::InvalidSession(_))
    ));
}

#[core_async::test]
async fn test_monitor_without_source_starts_online_and_follows_reports() {
    let core = core_over(Arc::new(InMemoryStorage::new())).await;
    let session = core.open_session("nurse-1").await.unwrap();
    let queue = session.queue();
    queue.register_handler(OperationKind::RecordingUpload, handler_fn(|_| async { Ok(()) }));

    assert!(core.network().is_connected());
    core.network().report(false);

    queue.add_to_queue(upload("rec-1")).await.unwrap();
    assert!(queue.process_queue().await.is_empty());
    assert_eq!(queue.get_pending_count().await.unwrap(), 1);
}

#[core_async::test]
async fn test_network_source_sets_initial_state() {
    let mut source = MockSource::new();
    source
        .expect_get_network_info()
        .returning(|| Ok(NetworkInfo::disconnected()));
    source
        .expect_subscribe_changes()
        .returning(|| Ok(Box::new(ClosedStream) as Box<dyn NetworkChangeStream>));

    let config = CoreConfig::builder()
        .storage(Arc::new(InMemoryStorage::new()))
        .secure_store(Arc::new(InMemorySecureStore::new()))
        .network_source(Arc::new(source))
        .build()
        .unwrap();
    let core = CoreService::new(config).await.unwrap();

    assert!(!core.network().is_connected());
}

#[core_async::test]
async fn test_open_session_repairs_damaged_queue_records() {
    let storage = Arc::new(InMemoryStorage::new());
    let broken_key = format!("{}{}/item/broken", QUEUE_KEY_PREFIX, user_scope("nurse-1"));
    storage.set(&broken_key, "not json").await.unwrap();

    let core = core_over(storage.clone()).await;
    let session = core.open_session("nurse-1").await.unwrap();

    assert_eq!(session.queue_load_report().corrupted_keys, vec![broken_key.clone()]);
    assert!(session.recovery_report().recovered);
    assert!(storage.get(&broken_key).await.unwrap().is_none());
}

#[core_async::test]
async fn test_sign_out_clears_cache_but_keeps_queue() {
    let storage = Arc::new(InMemoryStorage::new());
    let core = core_over(storage.clone()).await;
    let session = core.open_session("nurse-1").await.unwrap();

    session
        .cache()
        .put(CacheCategory::Schedules, "today", &json!(["rounds"]))
        .await
        .unwrap();
    session.queue().add_to_queue(upload("rec-1")).await.unwrap();

    let removed = session.sign_out().await.unwrap();
    assert_eq!(removed, 1);

    let reopened = core.open_session("nurse-1").await.unwrap();
    assert!(reopened
        .cache()
        .keys(CacheCategory::Schedules)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(reopened.queue().get_pending_count().await.unwrap(), 1);
}

#[core_async::test]
async fn test_session_components_share_event_bus() {
    let core = core_over(Arc::new(InMemoryStorage::new())).await;
    let mut events = core.subscribe();
    let session = core.open_session("nurse-1").await.unwrap();

    session.queue().add_to_queue(upload("rec-1")).await.unwrap();

    let mut added = false;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Queue(QueueEvent::ItemAdded { pending_count, .. }) = event {
            assert_eq!(pending_count, 1);
            added = true;
        }
    }
    assert!(added);
}

#[core_async::test]
async fn test_closed_sessions_stop_listening_for_reconnection() {
    let core = core_over(Arc::new(InMemoryStorage::new())).await;

    for _ in 0..5 {
        let session = core.open_session("nurse-1").await.unwrap();
        assert_eq!(core.network().reconnection_listener_count(), 1);
        drop(session);
    }
    assert_eq!(core.network().reconnection_listener_count(), 0);

    let session = core.open_session("nurse-1").await.unwrap();
    session.sign_out().await.unwrap();
    assert_eq!(core.network().reconnection_listener_count(), 0);
}
