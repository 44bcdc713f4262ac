//! Telemetry store behaviour against an in-memory source and cache.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use telemetry_sync::mock::Call;
use telemetry_sync::storage::{CACHE_KEY_HISTORY, CACHE_KEY_LATEST};
use telemetry_sync::{
    Error, LatestStrategy, LightState, MemoryCache, MockSource, ReadingPayload, SnapshotCache,
    SqliteCache, StoreSettings, TelemetryFilter, TelemetryStore,
};

fn settings(strategy: LatestStrategy) -> StoreSettings {
    StoreSettings {
        default_filter: TelemetryFilter::default(),
        latest_strategy: strategy,
    }
}

fn sample_records() -> Vec<Value> {
    vec![
        json!({"uid": "dev-a", "datetime": "2024-05-01T10:00:00Z", "temp": 21.0, "hum": 40, "luz": 1}),
        json!({"uid": "dev-b", "datetime": "2024-05-01T12:00:00Z", "temp": 22.5, "hum": 41, "luz": 0}),
        json!({"uid": "dev-a", "datetime": "2024-05-01T11:00:00Z", "temp": 23.0, "hum": 42, "luz": "1"}),
    ]
}

fn derive_store(source: MockSource) -> TelemetryStore<MockSource> {
    TelemetryStore::new(source, MemoryCache::new(), settings(LatestStrategy::Derive))
}

fn tags(store: &TelemetryStore<MockSource>) -> Vec<String> {
    store
        .snapshot()
        .history
        .iter()
        .filter_map(|r| r.tag.clone())
        .collect()
}

#[tokio::test]
async fn test_history_is_sorted_and_latest_derived() {
    let store = derive_store(MockSource::with_records(sample_records()));

    assert!(store.start().await);

    let snapshot = store.snapshot();
    assert_eq!(tags(&store), ["dev-b", "dev-a", "dev-a"]);
    let latest = snapshot.latest.unwrap();
    assert_eq!(latest.tag.as_deref(), Some("dev-b"));
    assert_eq!(latest.light_state, LightState::Off);
    assert!(snapshot.last_updated_at.is_some());
    assert!(!snapshot.loading);
    assert!(!store
        .source()
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Latest(_))));
}

#[tokio::test]
async fn test_fetch_strategy_calls_latest_endpoint() {
    let store = TelemetryStore::new(
        MockSource::with_records(sample_records()),
        MemoryCache::new(),
        settings(LatestStrategy::Fetch),
    );

    assert!(store.refresh_all(&TelemetryFilter::default()).await);

    let calls = store.source().calls();
    assert!(calls.contains(&Call::Latest(1)));
    assert!(calls.iter().any(|c| matches!(c, Call::List(_))));
    assert_eq!(
        store.snapshot().latest.unwrap().tag.as_deref(),
        Some("dev-b")
    );
}

#[tokio::test]
async fn test_failure_keeps_stale_data() {
    let store = derive_store(MockSource::with_records(sample_records()));
    assert!(store.refresh_history(&TelemetryFilter::default()).await);
    let before = store.snapshot();

    store.source().fail_next(Error::HttpStatus {
        status: 500,
        message: None,
    });
    assert!(!store.refresh_history(&TelemetryFilter::default()).await);

    let after = store.snapshot();
    assert_eq!(after.history.len(), 3);
    assert_eq!(after.history, before.history);
    assert_eq!(after.latest, before.latest);
    assert_eq!(after.last_updated_at, before.last_updated_at);
    assert_eq!(after.error.as_deref(), Some("API 500: request failed"));
    assert!(!after.loading);
}

#[tokio::test]
async fn test_cached_snapshot_shown_before_any_request() {
    let cache = Arc::new(MemoryCache::new());
    cache
        .save(CACHE_KEY_LATEST, &json!({"tag": "demo-1", "temperature": 23.5}))
        .unwrap();

    let source = MockSource::new();
    source.set_offline(true);
    let store = TelemetryStore::new(source, cache.clone(), settings(LatestStrategy::Fetch));

    assert!(store.load_cache());
    let snapshot = store.snapshot();
    let latest = snapshot.latest.unwrap();
    assert_eq!(latest.tag.as_deref(), Some("demo-1"));
    assert_eq!(latest.temperature, Some(23.5));
    assert_eq!(snapshot.last_updated_at, None);
    assert_eq!(store.source().request_count(), 0);

    // The network is down: the cached reading stays visible next to the error.
    assert!(!store.start().await);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.latest.unwrap().tag.as_deref(), Some("demo-1"));
    assert!(snapshot.error.is_some());
    assert_eq!(snapshot.last_updated_at, None);
}

#[tokio::test]
async fn test_empty_cache_restores_nothing() {
    let store = derive_store(MockSource::new());
    assert!(!store.load_cache());
    assert_eq!(store.snapshot().latest, None);
}

#[tokio::test]
async fn test_successful_fetch_is_persisted() {
    let cache = Arc::new(MemoryCache::new());
    let store = TelemetryStore::new(
        MockSource::with_records(sample_records()),
        cache.clone(),
        settings(LatestStrategy::Derive),
    );
    assert!(store.start().await);

    let history = cache.load(CACHE_KEY_HISTORY).unwrap().unwrap();
    assert_eq!(history.as_array().map(Vec::len), Some(3));
    let latest = cache.load(CACHE_KEY_LATEST).unwrap().unwrap();
    assert_eq!(latest["tag"], "dev-b");
    assert_eq!(latest["lightState"], "off");
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("telemetry_cache.db");

    {
        let store = TelemetryStore::new(
            MockSource::with_records(sample_records()),
            SqliteCache::open(&path).unwrap(),
            settings(LatestStrategy::Derive),
        );
        assert!(store.start().await);
    }

    let source = MockSource::new();
    source.set_offline(true);
    let store = TelemetryStore::new(
        source,
        SqliteCache::open(&path).unwrap(),
        settings(LatestStrategy::Derive),
    );
    assert!(store.load_cache());

    let snapshot = store.snapshot();
    assert_eq!(snapshot.history.len(), 3);
    assert_eq!(snapshot.history[0].tag.as_deref(), Some("dev-b"));
    assert!(snapshot.history[0].parsed_timestamp_millis > 0);
    assert_eq!(snapshot.last_updated_at, None);
}

#[tokio::test]
async fn test_mutation_without_id_sends_no_request() {
    let store = derive_store(MockSource::with_records(sample_records()));
    let payload = ReadingPayload::new().temperature(19.0);

    let err = store.replace(None, &payload).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(store.patch(None, &payload).await.is_err());
    assert!(store.delete(None).await.is_err());

    assert_eq!(store.source().request_count(), 0);
    assert!(store
        .snapshot()
        .error
        .unwrap()
        .contains("requires a record id"));
}

#[tokio::test]
async fn test_mutation_refreshes_with_last_filter() {
    let store = derive_store(MockSource::with_records(sample_records()));
    let filter = TelemetryFilter::default().with_tag("dev-a");
    assert!(store.refresh_history(&filter).await);
    assert_eq!(tags(&store), ["dev-a", "dev-a"]);

    let created = store
        .create(
            &ReadingPayload::new()
                .tag("dev-a")
                .timestamp("2024-05-02T08:00:00Z")
                .temperature(24.0)
                .light(true),
        )
        .await
        .unwrap();
    assert!(created.id.is_some());
    assert_eq!(created.light_state, LightState::On);

    assert_eq!(tags(&store), ["dev-a", "dev-a", "dev-a"]);
    let calls = store.source().calls();
    assert!(matches!(calls[1], Call::Create(_)));
    assert_eq!(calls[2], Call::List(filter));
}

#[tokio::test]
async fn test_failed_mutation_does_not_refresh() {
    let store = derive_store(MockSource::with_records(sample_records()));
    store.source().fail_next(Error::HttpStatus {
        status: 400,
        message: Some("temperatura is required".into()),
    });

    let err = store.create(&ReadingPayload::new().tag("x")).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(store.source().request_count(), 1);
    assert_eq!(
        store.snapshot().error.as_deref(),
        Some("API 400: temperatura is required")
    );
}

#[tokio::test]
async fn test_delete_missing_record_is_success() {
    let store = derive_store(MockSource::with_records(sample_records()));

    store.delete(Some(99)).await.unwrap();
    assert_eq!(store.snapshot().error, None);

    store.delete(Some(1)).await.unwrap();
    assert_eq!(store.snapshot().history.len(), 2);
}

#[tokio::test]
async fn test_patch_keeps_unsent_fields() {
    let store = derive_store(MockSource::with_records(sample_records()));
    let patched = store
        .patch(Some(2), &ReadingPayload::new().humidity(55.0))
        .await
        .unwrap();
    assert_eq!(patched.tag.as_deref(), Some("dev-b"));
    assert_eq!(patched.temperature, Some(22.5));
    assert_eq!(patched.humidity, Some(55.0));
}

#[tokio::test]
async fn test_get_by_id_not_found_is_none() {
    let store = derive_store(MockSource::with_records(sample_records()));
    assert!(store.get_by_id(42).await.unwrap().is_none());
    let found = store.get_by_id(1).await.unwrap().unwrap();
    assert_eq!(found.tag.as_deref(), Some("dev-a"));
    assert_eq!(store.snapshot().error, None);
}

#[tokio::test(start_paused = true)]
async fn test_last_resolved_fetch_wins() {
    let source = MockSource::with_records(sample_records());
    source.delay_tag("dev-a", Duration::from_millis(200));
    source.delay_tag("dev-b", Duration::from_millis(50));
    let store = derive_store(source);

    let slow = TelemetryFilter::default().with_tag("dev-a");
    let fast = TelemetryFilter::default().with_tag("dev-b");
    let (a, b) = tokio::join!(store.refresh_history(&slow), store.refresh_history(&fast));
    assert!(a && b);

    assert_eq!(tags(&store), ["dev-a", "dev-a"]);
    assert!(!store.snapshot().loading);
}

#[tokio::test(start_paused = true)]
async fn test_loading_flag_raised_while_in_flight() {
    let source = MockSource::with_records(sample_records());
    source.delay_tag("dev-a", Duration::from_millis(100));
    let store = derive_store(source);
    let mut rx = store.subscribe();

    let filter = TelemetryFilter::default().with_tag("dev-a");
    let (ok, during) = tokio::join!(store.refresh_history(&filter), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = store.snapshot();
        (snapshot.loading, snapshot.refreshing)
    });

    assert!(ok);
    assert_eq!(during, (true, false));
    assert!(rx.has_changed().unwrap());
    assert!(!rx.borrow_and_update().loading);
}

#[tokio::test]
async fn test_health_probe_leaves_state_alone() {
    let source = MockSource::new();
    source.set_offline(true);
    let store = derive_store(source);

    assert!(!store.probe_health().await);
    assert_eq!(store.snapshot().error, None);

    store.source().set_offline(false);
    assert!(store.probe_health().await);
}
