//! The seam between the telemetry store and the remote API.
//!
//! [`crate::net::ApiClient`] is the production implementation and
//! [`crate::mock::MockSource`] the in-memory one. Records cross this boundary
//! raw (envelope already removed); normalization happens in the store.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ReadingPayload, TelemetryFilter};

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Records matching the filter set, in response order.
    async fn list(&self, filter: &TelemetryFilter) -> Result<Vec<Value>>;

    /// The newest `limit` records.
    async fn latest(&self, limit: usize) -> Result<Vec<Value>>;

    /// A single record, or [`crate::Error::NotFound`].
    async fn get_by_id(&self, id: i64) -> Result<Value>;

    async fn create(&self, payload: &ReadingPayload) -> Result<Value>;

    async fn replace(&self, id: i64, payload: &ReadingPayload) -> Result<Value>;

    async fn patch(&self, id: i64, payload: &ReadingPayload) -> Result<Value>;

    async fn delete(&self, id: i64) -> Result<()>;

    /// Connectivity probe. Must not be awaited on the refresh path.
    async fn health(&self) -> Result<Value>;
}
