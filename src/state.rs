//! Observable telemetry state.
//!
//! The current [`TelemetrySnapshot`] lives in a `tokio::sync::watch` channel:
//! presentation code subscribes and is woken on every transition, while only
//! the store holds the sending side.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::types::Reading;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub latest: Option<Reading>,
    /// Most recent first.
    pub history: Vec<Reading>,
    /// A fetch is in flight.
    pub loading: bool,
    /// A user-triggered refresh is in flight.
    pub refreshing: bool,
    /// Message of the most recent failed operation.
    pub error: Option<String>,
    /// Set on fetch success only, never from the cache.
    pub last_updated_at: Option<DateTime<Utc>>,
}

pub type SnapshotReceiver = watch::Receiver<TelemetrySnapshot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Mount, filter change or post-mutation refresh: raises `loading`.
    Load,
    /// Pull-to-refresh: raises `loading` and `refreshing`.
    Refresh,
}

pub(crate) struct StateCell {
    tx: watch::Sender<TelemetrySnapshot>,
    loading: AtomicUsize,
    refreshing: AtomicUsize,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(TelemetrySnapshot::default());
        Self {
            tx,
            loading: AtomicUsize::new(0),
            refreshing: AtomicUsize::new(0),
        }
    }

    pub(crate) fn subscribe(&self) -> SnapshotReceiver {
        self.tx.subscribe()
    }

    pub(crate) fn snapshot(&self) -> TelemetrySnapshot {
        self.tx.borrow().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut TelemetrySnapshot)) {
        self.tx.send_modify(f);
    }

    /// Raise the flags for `kind` until the returned guard is dropped.
    ///
    /// Overlapping fetches are counted, so the flags stay up until the last one ends.
    pub(crate) fn begin(&self, kind: FetchKind) -> InFlight<'_> {
        self.loading.fetch_add(1, Ordering::SeqCst);
        if kind == FetchKind::Refresh {
            self.refreshing.fetch_add(1, Ordering::SeqCst);
        }
        self.publish_flags();
        InFlight { cell: self, kind }
    }

    fn publish_flags(&self) {
        let loading = self.loading.load(Ordering::SeqCst) > 0;
        let refreshing = self.refreshing.load(Ordering::SeqCst) > 0;
        self.tx.send_modify(|s| {
            s.loading = loading;
            s.refreshing = refreshing;
        });
    }
}

/// Lowers the in-flight flags on drop, including when the fetch future is cancelled.
pub(crate) struct InFlight<'a> {
    cell: &'a StateCell,
    kind: FetchKind,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cell.loading.fetch_sub(1, Ordering::SeqCst);
        if self.kind == FetchKind::Refresh {
            self.cell.refreshing.fetch_sub(1, Ordering::SeqCst);
        }
        self.cell.publish_flags();
    }
}
