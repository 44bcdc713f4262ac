//! In-memory [`TelemetrySource`] for tests and offline demos.
//!
//! - **Call recording**: every request is logged as a [`Call`]
//! - **Failure injection**: fail the next N calls, or every call while offline
//! - **Latency simulation**: per-tag delays on `list`, for ordering scenarios

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::normalize::normalize;
use crate::source::TelemetrySource;
use crate::types::{ReadingPayload, TelemetryFilter};
use crate::variant::ClientFilter;

/// A request received by [`MockSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List(TelemetryFilter),
    Latest(usize),
    Get(i64),
    Create(ReadingPayload),
    Replace(i64, ReadingPayload),
    Patch(i64, ReadingPayload),
    Delete(i64),
    Health,
}

#[derive(Default)]
pub struct MockSource {
    records: Mutex<Vec<Value>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<VecDeque<Error>>,
    offline: AtomicBool,
    tag_latency: Mutex<HashMap<String, Duration>>,
    next_id: AtomicI64,
}

impl std::fmt::Debug for MockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSource")
            .field("records", &self.records().len())
            .field("calls", &self.request_count())
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with raw records (either schema). Records without an id get one.
    pub fn with_records(records: impl IntoIterator<Item = Value>) -> Self {
        let source = Self::new();
        source.set_records(records);
        source
    }

    pub fn set_records(&self, records: impl IntoIterator<Item = Value>) {
        let records: Vec<Value> = records
            .into_iter()
            .map(|mut record| {
                if let Some(obj) = record.as_object_mut() {
                    if !obj.contains_key("id") {
                        obj.insert("id".into(), Value::from(self.allocate_id()));
                    }
                }
                record
            })
            .collect();
        *lock(&self.records) = records;
    }

    pub fn records(&self) -> Vec<Value> {
        lock(&self.records).clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Fail the next call with `error`. Queued errors are used in order.
    pub fn fail_next(&self, error: Error) {
        lock(&self.failures).push_back(error);
    }

    /// While offline every call times out.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay `list` responses whose filter tag is `tag`.
    pub fn delay_tag(&self, tag: impl Into<String>, delay: Duration) {
        lock(&self.tag_latency).insert(tag.into(), delay);
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, call: Call) -> Result<()> {
        lock(&self.calls).push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Timeout {
                url: "mock://offline".to_string(),
                duration: Duration::from_millis(8000),
            });
        }
        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn not_found(id: i64) -> Error {
        Error::NotFound {
            resource: format!("/mock/{}", id),
            message: Some("Registro no encontrado".to_string()),
        }
    }

    /// Run `f` on the record with `id` while holding the records lock.
    fn with_record<T>(&self, id: i64, f: impl FnOnce(&mut Vec<Value>, usize) -> T) -> Result<T> {
        let mut records = lock(&self.records);
        let index = records
            .iter()
            .position(|r| normalize(r).id == Some(id))
            .ok_or_else(|| Self::not_found(id))?;
        Ok(f(&mut records, index))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Canonical field names, as the normalizer reads them back.
fn merge_payload(record: &mut Map<String, Value>, payload: &ReadingPayload) {
    if let Some(tag) = &payload.tag {
        record.insert("tag".into(), json!(tag));
    }
    if let Some(timestamp) = &payload.timestamp {
        record.insert("timestamp".into(), json!(timestamp));
    }
    if let Some(temperature) = payload.temperature {
        record.insert("temperature".into(), json!(temperature));
    }
    if let Some(humidity) = payload.humidity {
        record.insert("humidity".into(), json!(humidity));
    }
    if let Some(light) = payload.light {
        record.insert("lightState".into(), json!(if light { "on" } else { "off" }));
    }
}

#[async_trait]
impl TelemetrySource for MockSource {
    async fn list(&self, filter: &TelemetryFilter) -> Result<Vec<Value>> {
        self.record(Call::List(filter.clone()))?;
        let records = self.records();

        let Some(tag) = filter.tag() else {
            return Ok(records);
        };
        let delay = lock(&self.tag_latency).get(tag).copied();
        let matching = ClientFilter::Tag(tag.to_string()).apply(records);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(matching)
    }

    async fn latest(&self, limit: usize) -> Result<Vec<Value>> {
        self.record(Call::Latest(limit))?;
        let mut records = self.records();
        records.sort_by_key(|r| std::cmp::Reverse(normalize(r).parsed_timestamp_millis));
        records.truncate(limit.max(1));
        Ok(records)
    }

    async fn get_by_id(&self, id: i64) -> Result<Value> {
        self.record(Call::Get(id))?;
        self.with_record(id, |records, index| records[index].clone())
    }

    async fn create(&self, payload: &ReadingPayload) -> Result<Value> {
        self.record(Call::Create(payload.clone()))?;
        let mut record = Map::new();
        record.insert("id".into(), Value::from(self.allocate_id()));
        merge_payload(&mut record, payload);
        let record = Value::Object(record);
        lock(&self.records).push(record.clone());
        Ok(record)
    }

    async fn replace(&self, id: i64, payload: &ReadingPayload) -> Result<Value> {
        self.record(Call::Replace(id, payload.clone()))?;
        let mut record = Map::new();
        record.insert("id".into(), Value::from(id));
        merge_payload(&mut record, payload);
        let record = Value::Object(record);
        self.with_record(id, |records, index| {
            records[index] = record.clone();
            record
        })
    }

    async fn patch(&self, id: i64, payload: &ReadingPayload) -> Result<Value> {
        self.record(Call::Patch(id, payload.clone()))?;
        self.with_record(id, |records, index| {
            let mut merged = match serde_json::to_value(normalize(&records[index])) {
                Ok(Value::Object(obj)) => obj,
                _ => Map::new(),
            };
            merge_payload(&mut merged, payload);
            records[index] = Value::Object(merged);
            records[index].clone()
        })
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.record(Call::Delete(id))?;
        self.with_record(id, |records, index| {
            records.remove(index);
        })
    }

    async fn health(&self) -> Result<Value> {
        self.record(Call::Health)?;
        Ok(json!({"success": true, "message": "ok"}))
    }
}
