//! Telemetry store: reconciles the remote API with the local snapshot cache
//! and publishes the result as observable state.
//!
//! Every fetch clears `error`, raises the in-flight flags, and on success
//! replaces `history`/`latest`, stamps `last_updated_at` and then writes the
//! snapshot to the cache. On failure the previous data stays in place and only
//! `error` changes.
//!
//! Overlapping refreshes are neither coalesced nor cancelled: each applies its
//! result when it resolves, so the last one to finish wins even if it was
//! issued first.

use std::future::Future;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::normalize::{normalize, normalize_history};
use crate::source::TelemetrySource;
use crate::state::{FetchKind, SnapshotReceiver, StateCell, TelemetrySnapshot};
use crate::storage::{SnapshotCache, CACHE_KEY_HISTORY, CACHE_KEY_LATEST};
use crate::types::{Reading, ReadingPayload, TelemetryFilter};
use crate::variant::{Backend, LatestStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    /// Filter set used at start-up and until a caller supplies another.
    pub default_filter: TelemetryFilter,
    pub latest_strategy: LatestStrategy,
}

impl StoreSettings {
    pub fn for_backend(backend: &Backend) -> Self {
        Self {
            default_filter: TelemetryFilter::default(),
            latest_strategy: backend.default_latest_strategy(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            default_filter: config.initial_filter(),
            latest_strategy: config.latest_strategy(),
        }
    }
}

pub struct TelemetryStore<S> {
    source: S,
    cache: Box<dyn SnapshotCache>,
    state: StateCell,
    settings: StoreSettings,
    last_filter: Mutex<TelemetryFilter>,
}

impl<S: TelemetrySource> TelemetryStore<S> {
    pub fn new(source: S, cache: impl SnapshotCache + 'static, settings: StoreSettings) -> Self {
        let last_filter = Mutex::new(settings.default_filter.clone());
        Self {
            source,
            cache: Box::new(cache),
            state: StateCell::new(),
            settings,
            last_filter,
        }
    }

    pub fn subscribe(&self) -> SnapshotReceiver {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.snapshot()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Filter set of the most recent history fetch.
    pub fn last_filter(&self) -> TelemetryFilter {
        self.last_filter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember(&self, filter: &TelemetryFilter) {
        *self.last_filter.lock().unwrap_or_else(|e| e.into_inner()) = filter.clone();
    }

    /// Populate state from the cached snapshot. Returns whether anything was restored.
    ///
    /// Does not touch `last_updated_at`; cache errors are logged and ignored.
    pub fn load_cache(&self) -> bool {
        let history = self.load_key(CACHE_KEY_HISTORY).map(|value| match value {
            Value::Array(items) => normalize_history(&items),
            _ => Vec::new(),
        });
        let latest = self
            .load_key(CACHE_KEY_LATEST)
            .map(|value| (!value.is_null()).then(|| normalize(&value)));

        if history.is_none() && latest.is_none() {
            debug!("No cached snapshot");
            return false;
        }

        info!(
            history = history.as_ref().map_or(0, Vec::len),
            has_latest = latest.as_ref().is_some_and(Option::is_some),
            "Restored cached snapshot"
        );
        self.state.update(|s| {
            if let Some(history) = history {
                s.history = history;
            }
            if let Some(latest) = latest {
                s.latest = latest;
            }
        });
        true
    }

    fn load_key(&self, key: &str) -> Option<Value> {
        match self.cache.load(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read cached snapshot");
                None
            }
        }
    }

    /// Cache-first start: restore the snapshot, then fetch with the default filter.
    pub async fn start(&self) -> bool {
        self.load_cache();
        let filter = self.settings.default_filter.clone();
        self.fetch_all(&filter, FetchKind::Load).await
    }

    /// User-triggered refresh of history and latest. Returns whether it succeeded.
    pub async fn refresh_all(&self, filter: &TelemetryFilter) -> bool {
        self.fetch_all(filter, FetchKind::Refresh).await
    }

    /// Re-fetch history, e.g. after a filter change. Returns whether it succeeded.
    pub async fn refresh_history(&self, filter: &TelemetryFilter) -> bool {
        let _in_flight = self.state.begin(FetchKind::Load);
        self.clear_error();
        self.remember(filter);

        match self.fetch_history(filter).await {
            Ok(history) => {
                let latest = match self.settings.latest_strategy {
                    LatestStrategy::Derive => Some(history.first().cloned()),
                    LatestStrategy::Fetch => None,
                };
                self.apply(history, latest);
                true
            }
            Err(e) => {
                self.fail("refresh history", &e);
                false
            }
        }
    }

    /// Bring `latest` up to date, from history or from the latest endpoint
    /// depending on the configured strategy.
    pub async fn refresh_latest(&self) -> bool {
        if self.settings.latest_strategy == LatestStrategy::Derive {
            let filter = self.last_filter();
            return self.refresh_history(&filter).await;
        }

        let _in_flight = self.state.begin(FetchKind::Load);
        self.clear_error();
        match self.fetch_latest().await {
            Ok(latest) => {
                self.state.update(|s| {
                    s.latest = latest;
                    s.last_updated_at = Some(Utc::now());
                });
                self.persist();
                true
            }
            Err(e) => {
                self.fail("refresh latest", &e);
                false
            }
        }
    }

    async fn fetch_all(&self, filter: &TelemetryFilter, kind: FetchKind) -> bool {
        let _in_flight = self.state.begin(kind);
        self.clear_error();
        self.remember(filter);

        let outcome = match self.settings.latest_strategy {
            LatestStrategy::Derive => self.fetch_history(filter).await.map(|history| {
                let latest = history.first().cloned();
                (history, latest)
            }),
            LatestStrategy::Fetch => {
                let (history, latest) =
                    tokio::join!(self.fetch_history(filter), self.fetch_latest());
                history.and_then(|h| latest.map(|l| (h, l)))
            }
        };

        match outcome {
            Ok((history, latest)) => {
                self.apply(history, Some(latest));
                true
            }
            Err(e) => {
                self.fail("refresh", &e);
                false
            }
        }
    }

    async fn fetch_history(&self, filter: &TelemetryFilter) -> Result<Vec<Reading>> {
        let records = self.source.list(filter).await?;
        let mut history = normalize_history(&records);
        if filter.limit > 0 {
            history.truncate(filter.limit);
        }
        Ok(history)
    }

    async fn fetch_latest(&self) -> Result<Option<Reading>> {
        let records = self.source.latest(1).await?;
        Ok(normalize_history(&records).into_iter().next())
    }

    /// Publish a successful fetch, then persist it.
    fn apply(&self, history: Vec<Reading>, latest: Option<Option<Reading>>) {
        info!(count = history.len(), "History refreshed");
        self.state.update(|s| {
            s.history = history;
            if let Some(latest) = latest {
                s.latest = latest;
            }
            s.error = None;
            s.last_updated_at = Some(Utc::now());
        });
        self.persist();
    }

    /// Write the current snapshot to the cache. Failures are logged only.
    fn persist(&self) {
        let snapshot = self.state.snapshot();
        let writes = [
            (CACHE_KEY_HISTORY, serde_json::to_value(&snapshot.history)),
            (CACHE_KEY_LATEST, serde_json::to_value(&snapshot.latest)),
        ];
        for (key, value) in writes {
            let result = value
                .map_err(Into::into)
                .and_then(|value| self.cache.save(key, &value));
            if let Err(e) = result {
                warn!(key, error = %e, "Failed to write snapshot cache");
            }
        }
    }

    fn clear_error(&self) {
        self.state.update(|s| s.error = None);
    }

    fn fail(&self, operation: &str, error: &Error) {
        warn!(operation, error = %error, "Telemetry operation failed");
        let message = error.to_string();
        self.state.update(|s| s.error = Some(message));
    }

    fn require_id(&self, id: Option<i64>, operation: &str) -> Result<i64> {
        id.ok_or_else(|| {
            let err = Error::Validation(format!("{} requires a record id", operation));
            self.fail(operation, &err);
            err
        })
    }

    /// Run a write, then refresh history with the last-used filter.
    /// On failure the state is left as it was, apart from `error`.
    async fn mutate<T>(&self, operation: &str, write: impl Future<Output = Result<T>>) -> Result<T> {
        self.clear_error();
        match write.await {
            Ok(value) => {
                debug!(operation, "Write succeeded, refreshing history");
                let filter = self.last_filter();
                self.refresh_history(&filter).await;
                Ok(value)
            }
            Err(e) => {
                self.fail(operation, &e);
                Err(e)
            }
        }
    }

    pub async fn create(&self, payload: &ReadingPayload) -> Result<Reading> {
        let created = self.mutate("create", self.source.create(payload)).await?;
        Ok(normalize(&created))
    }

    pub async fn replace(&self, id: Option<i64>, payload: &ReadingPayload) -> Result<Reading> {
        let id = self.require_id(id, "replace")?;
        let updated = self.mutate("replace", self.source.replace(id, payload)).await?;
        Ok(normalize(&updated))
    }

    pub async fn patch(&self, id: Option<i64>, payload: &ReadingPayload) -> Result<Reading> {
        let id = self.require_id(id, "patch")?;
        let updated = self.mutate("patch", self.source.patch(id, payload)).await?;
        Ok(normalize(&updated))
    }

    /// Deleting a record the server no longer has counts as success.
    pub async fn delete(&self, id: Option<i64>) -> Result<()> {
        let id = self.require_id(id, "delete")?;
        let write = async {
            match self.source.delete(id).await {
                Err(e) if e.is_not_found() => {
                    info!(id, "Record already deleted");
                    Ok(())
                }
                other => other,
            }
        };
        self.mutate("delete", write).await
    }

    /// One record by id; `Ok(None)` when the server does not have it.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Reading>> {
        self.clear_error();
        match self.source.get_by_id(id).await {
            Ok(raw) => Ok(Some(normalize(&raw))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                self.fail("get", &e);
                Err(e)
            }
        }
    }

    /// Connectivity probe. Leaves the observable state alone.
    pub async fn probe_health(&self) -> bool {
        match self.source.health().await {
            Ok(status) => {
                debug!(status = %status, "API healthy");
                true
            }
            Err(e) => {
                warn!(error = %e, "API health check failed");
                false
            }
        }
    }
}
