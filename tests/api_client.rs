//! API client against an in-process HTTP server speaking both backend schemas.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use telemetry_sync::normalize::normalize;
use telemetry_sync::{
    ApiClient, Backend, DateRange, Error, LightState, ReadingPayload, TelemetryFilter,
};

type Hits = Arc<Mutex<Vec<String>>>;

fn record_hit(hits: &Hits, uri: &Uri) {
    hits.lock().unwrap().push(uri.to_string());
}

fn sensor_records() -> Vec<Value> {
    vec![
        json!({"id": 1, "ultima_tarjeta_rfid": "demo-1", "temperatura": 23.5, "humedad": 40, "luz_detectada": true, "fechaCreacion": "2024-05-01T10:00:00"}),
        json!({"id": 2, "ultima_tarjeta_rfid": "demo-2", "temperatura": 26.0, "humedad": 50, "luz_detectada": false, "fechaCreacion": "2024-05-02T10:00:00"}),
        json!({"id": 3, "ultima_tarjeta_rfid": "demo-1", "temperatura": 21.0, "humedad": 60, "luz_detectada": true, "fechaCreacion": "2024-05-03T10:00:00"}),
    ]
}

fn telemetry_records() -> Vec<Value> {
    vec![
        json!({"id": 1, "uid": "Demo-1", "temp": 23.5, "hum": 40, "luz": 1, "datetime": "2024-05-01T10:00:00Z"}),
        json!({"id": 2, "uid": "demo-2", "temp": 26.0, "hum": 50, "luz": 0, "datetime": "2024-05-02T10:00:00Z"}),
        json!({"id": 3, "uid": "demo-1", "temp": 21.0, "hum": 60, "luz": 1, "datetime": "2024-05-02T18:30:00Z"}),
        json!({"id": 4, "uid": "demo-3", "temp": 30.0, "hum": 70, "luz": 0, "datetime": "yesterday"}),
    ]
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({"success": true, "data": data}))
}

fn sensor_data_app(hits: Hits) -> Router {
    Router::new()
        .route(
            "/api/sensor-data",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                envelope(Value::Array(sensor_records()))
            })
            .post(|State(hits): State<Hits>, uri: Uri, Json(body): Json<Value>| async move {
                record_hit(&hits, &uri);
                if body.get("temperatura").is_none() {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"success": false, "message": "temperatura is required"})),
                    );
                }
                let mut created = body;
                created["id"] = json!(10);
                (StatusCode::CREATED, envelope(created))
            }),
        )
        .route(
            "/api/sensor-data/rfid/{tag}",
            get(|State(hits): State<Hits>, uri: Uri, Path(tag): Path<String>| async move {
                record_hit(&hits, &uri);
                let matching: Vec<Value> = sensor_records()
                    .into_iter()
                    .filter(|r| r["ultima_tarjeta_rfid"] == tag.as_str())
                    .collect();
                envelope(Value::Array(matching))
            }),
        )
        .route(
            "/api/sensor-data/date-range",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                envelope(Value::Array(sensor_records()[..2].to_vec()))
            }),
        )
        .route(
            "/api/sensor-data/latest/{n}",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                envelope(sensor_records()[2].clone())
            }),
        )
        .route(
            "/api/sensor-data/light-detected",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                let lit: Vec<Value> = sensor_records()
                    .into_iter()
                    .filter(|r| r["luz_detectada"] == true)
                    .collect();
                envelope(Value::Array(lit))
            }),
        )
        .route(
            "/api/sensor-data/stats/total-records",
            get(|| async { envelope(json!({"total_records": 3})) }),
        )
        .route(
            "/api/sensor-data/stats/temperature-max",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                envelope(json!({"max_temperature": 26.0}))
            }),
        )
        .route(
            "/api/sensor-data/health",
            get(|| async { Json(json!({"success": true, "message": "ok"})) }),
        )
        .route(
            "/api/sensor-data/{id}",
            get(|Path(id): Path<i64>| async move {
                match sensor_records().into_iter().find(|r| r["id"] == id) {
                    Some(record) => (StatusCode::OK, envelope(record)),
                    None => (
                        StatusCode::NOT_FOUND,
                        Json(json!({"success": false, "message": "Registro no encontrado"})),
                    ),
                }
            })
            .delete(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                StatusCode::NO_CONTENT
            }),
        )
        .route(
            "/slow/api/sensor-data/health",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"success": true}))
            }),
        )
        .route("/broken/api/sensor-data", get(|| async { "<html>oops</html>" }))
        .route(
            "/failing/api/sensor-data",
            get(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "error": "database offline"})),
                )
            }),
        )
        .with_state(hits)
}

fn telemetry_app(hits: Hits) -> Router {
    Router::new()
        .route(
            "/api/telemetry",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                // The server ignores its filter parameters.
                Json(Value::Array(telemetry_records()))
            }),
        )
        .route(
            "/api/telemetry/latest",
            get(|State(hits): State<Hits>, uri: Uri| async move {
                record_hit(&hits, &uri);
                Json(Value::Array(telemetry_records()[2..3].to_vec()))
            }),
        )
        .route(
            "/api/telemetry/{id}",
            axum::routing::patch(|Path(id): Path<i64>, Json(body): Json<Value>| async move {
                let mut record = telemetry_records()
                    .into_iter()
                    .find(|r| r["id"] == id)
                    .unwrap_or_default();
                if let (Some(record), Some(body)) = (record.as_object_mut(), body.as_object()) {
                    record.extend(body.clone());
                }
                Json(record)
            }),
        )
        .with_state(hits)
}

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn sensor_data_client() -> (ApiClient, Hits) {
    let hits = Hits::default();
    let base = spawn(sensor_data_app(hits.clone())).await;
    let client = ApiClient::new(&base, Backend::sensor_data(), Duration::from_secs(5)).unwrap();
    (client, hits)
}

async fn telemetry_client() -> (ApiClient, Hits) {
    let hits = Hits::default();
    let base = spawn(telemetry_app(hits.clone())).await;
    let client = ApiClient::new(
        &base,
        Backend::telemetry("/api/telemetry"),
        Duration::from_secs(5),
    )
    .unwrap();
    (client, hits)
}

fn last_hit(hits: &Hits) -> String {
    hits.lock().unwrap().last().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_list_unwraps_envelope() {
    let (client, hits) = sensor_data_client().await;

    let records = client.list(&TelemetryFilter::default()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(last_hit(&hits), "/api/sensor-data");

    let first = normalize(&records[0]);
    assert_eq!(first.tag.as_deref(), Some("demo-1"));
    assert_eq!(first.temperature, Some(23.5));
    assert_eq!(first.light_state, LightState::On);
}

#[tokio::test]
async fn test_tag_takes_precedence_over_range() {
    let (client, hits) = sensor_data_client().await;
    let filter = TelemetryFilter::default()
        .with_tag("demo-1")
        .with_range(Some("2024-05-01".into()), Some("2024-05-02".into()));

    let records = client.list(&filter).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(last_hit(&hits), "/api/sensor-data/rfid/demo-1");
}

#[tokio::test]
async fn test_closed_range_uses_date_range_endpoint() {
    let (client, hits) = sensor_data_client().await;
    let filter = TelemetryFilter::default()
        .with_range(Some("2024-05-01".into()), Some("2024-05-02".into()));

    client.list(&filter).await.unwrap();
    let hit = last_hit(&hits);
    assert!(hit.starts_with("/api/sensor-data/date-range?"), "{hit}");
    assert!(hit.contains("startDate=2024-05-01T00%3A00%3A00"), "{hit}");
    assert!(hit.contains("endDate=2024-05-02T23%3A59%3A59"), "{hit}");
}

#[tokio::test]
async fn test_open_range_filters_locally() {
    let (client, hits) = sensor_data_client().await;
    let filter = TelemetryFilter::default().with_range(Some("2024-05-02".into()), None);

    let records = client.list(&filter).await.unwrap();
    assert_eq!(last_hit(&hits), "/api/sensor-data");
    let ids: Vec<_> = records.iter().filter_map(|r| normalize(r).id).collect();
    assert_eq!(ids, [2, 3]);
}

#[tokio::test]
async fn test_latest_accepts_single_object() {
    let (client, hits) = sensor_data_client().await;

    let latest = client.latest(1).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(normalize(&latest[0]).id, Some(3));
    assert_eq!(last_hit(&hits), "/api/sensor-data/latest/1");
}

#[tokio::test]
async fn test_get_missing_record_is_not_found() {
    let (client, _) = sensor_data_client().await;

    let found = client.get_by_id(2).await.unwrap();
    assert_eq!(found["ultima_tarjeta_rfid"], "demo-2");

    match client.get_by_id(99).await {
        Err(Error::NotFound { resource, message }) => {
            assert_eq!(resource, "/api/sensor-data/99");
            assert_eq!(message.as_deref(), Some("Registro no encontrado"));
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_create_encodes_sensor_data_fields() {
    let (client, _) = sensor_data_client().await;
    let payload = ReadingPayload::new()
        .tag("demo-9")
        .temperature(19.5)
        .humidity(45.0)
        .light(false)
        .timestamp("2024-05-04T00:00:00Z");

    let created = client.create(&payload).await.unwrap();
    assert_eq!(created["id"], 10);
    assert_eq!(created["ultima_tarjeta_rfid"], "demo-9");
    assert_eq!(created["luzDetectada"], false);
    assert_eq!(created["timestamp"], 1_714_780_800_000_i64);
}

#[tokio::test]
async fn test_rejected_write_carries_server_message() {
    let (client, _) = sensor_data_client().await;

    let err = client
        .create(&ReadingPayload::new().tag("demo-9"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(err.to_string(), "API 400: temperatura is required");
}

#[tokio::test]
async fn test_delete_accepts_no_content() {
    let (client, hits) = sensor_data_client().await;
    client.delete(2).await.unwrap();
    assert_eq!(last_hit(&hits), "/api/sensor-data/2");
}

#[tokio::test]
async fn test_patch_unsupported_on_sensor_data() {
    let (client, hits) = sensor_data_client().await;

    let err = client
        .patch(1, &ReadingPayload::new().humidity(10.0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported { operation: "patch", .. }));
    assert!(hits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sensor_data_stats() {
    let (client, hits) = sensor_data_client().await;

    assert_eq!(client.total_records().await.unwrap(), 3);
    assert!(client.is_reachable().await);

    let lit = client.light_detected().await.unwrap();
    assert_eq!(lit.len(), 2);

    let range = DateRange::new(Some("2024-05-01".into()), Some("2024-05-03".into()));
    assert_eq!(client.max_temperature(&range).await.unwrap(), Some(26.0));
    assert!(last_hit(&hits).starts_with("/api/sensor-data/stats/temperature-max?"));

    let open = DateRange::new(Some("2024-05-01".into()), None);
    assert!(matches!(
        client.max_temperature(&open).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let hits = Hits::default();
    let base = spawn(sensor_data_app(hits)).await;
    let client = ApiClient::new(
        &format!("{}/slow", base),
        Backend::sensor_data(),
        Duration::from_millis(100),
    )
    .unwrap();

    match client.health().await {
        Err(Error::Timeout { duration, .. }) => assert_eq!(duration, Duration::from_millis(100)),
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_host_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ApiClient::new(
        &format!("http://{}", addr),
        Backend::sensor_data(),
        Duration::from_secs(2),
    )
    .unwrap();

    let err = client.list(&TelemetryFilter::default()).await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "{err:?}");
    assert!(!client.is_reachable().await);
}

#[tokio::test]
async fn test_non_json_body_is_decode_error() {
    let hits = Hits::default();
    let base = spawn(sensor_data_app(hits)).await;

    let broken = ApiClient::new(
        &format!("{}/broken", base),
        Backend::sensor_data(),
        Duration::from_secs(5),
    )
    .unwrap();
    assert!(matches!(
        broken.list(&TelemetryFilter::default()).await,
        Err(Error::Decode(_))
    ));

    let failing = ApiClient::new(
        &format!("{}/failing", base),
        Backend::sensor_data(),
        Duration::from_secs(5),
    )
    .unwrap();
    let err = failing.list(&TelemetryFilter::default()).await.unwrap_err();
    assert_eq!(err.to_string(), "API 500: database offline");
}

#[tokio::test]
async fn test_telemetry_tag_filter_sent_and_applied() {
    let (client, hits) = telemetry_client().await;
    let filter = TelemetryFilter::default()
        .with_tag("DEMO-1")
        .with_range(Some("2024-05-02".into()), None);

    let records = client.list(&filter).await.unwrap();
    let ids: Vec<_> = records.iter().filter_map(|r| normalize(r).id).collect();
    assert_eq!(ids, [1, 3]);

    let hit = last_hit(&hits);
    assert!(hit.starts_with("/api/telemetry?uid=DEMO-1"), "{hit}");
    assert!(hit.contains("limit=50"), "{hit}");
    assert!(hit.contains("sort=desc"), "{hit}");
    assert!(!hit.contains("from="), "{hit}");
}

#[tokio::test]
async fn test_telemetry_range_is_inclusive() {
    let (client, hits) = telemetry_client().await;
    let filter = TelemetryFilter::default().with_range(
        Some("2024-05-02T10:00:00Z".into()),
        Some("2024-05-02T18:30:00Z".into()),
    );

    let records = client.list(&filter).await.unwrap();
    let ids: Vec<_> = records.iter().filter_map(|r| normalize(r).id).collect();
    // Record 4 has an unparseable timestamp and never matches a range.
    assert_eq!(ids, [2, 3]);

    let hit = last_hit(&hits);
    assert!(hit.contains("from=2024-05-02T10%3A00%3A00Z"), "{hit}");
    assert!(hit.contains("to=2024-05-02T18%3A30%3A00Z"), "{hit}");
}

#[tokio::test]
async fn test_telemetry_latest_and_patch() {
    let (client, hits) = telemetry_client().await;

    let latest = client.latest(1).await.unwrap();
    assert_eq!(normalize(&latest[0]).id, Some(3));
    assert_eq!(last_hit(&hits), "/api/telemetry/latest?limit=1");

    let patched = client
        .patch(2, &ReadingPayload::new().light(true))
        .await
        .unwrap();
    let reading = normalize(&patched);
    assert_eq!(reading.light_state, LightState::On);
    assert_eq!(reading.temperature, Some(26.0));
}

#[tokio::test]
async fn test_telemetry_stats_computed_locally() {
    let (client, _) = telemetry_client().await;

    assert_eq!(client.total_records().await.unwrap(), 4);

    let lit = client.light_detected().await.unwrap();
    assert_eq!(lit.len(), 2);

    let all = DateRange::default();
    assert_eq!(client.max_temperature(&all).await.unwrap(), Some(30.0));

    let day = DateRange::new(
        Some("2024-05-02T00:00:00Z".into()),
        Some("2024-05-02T23:59:59Z".into()),
    );
    assert_eq!(client.max_temperature(&day).await.unwrap(), Some(26.0));
    assert_eq!(client.average_humidity(&day).await.unwrap(), Some(55.0));
}
