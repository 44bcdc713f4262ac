//! HTTP client for the telemetry REST API.
//!
//! Every request carries its own timeout. Failures are classified into
//! [`Error::Timeout`] (deadline exceeded), [`Error::Transport`] (host not
//! reachable), [`Error::NotFound`], [`Error::HttpStatus`] and [`Error::Decode`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::normalize::{decode_number, normalize};
use crate::source::TelemetrySource;
use crate::types::{DateRange, ReadingPayload, TelemetryFilter};
use crate::variant::{range_filter, Backend, Route};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(8000);

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    backend: Backend,
    timeout: Duration,
}

impl ApiClient {
    /// Create a client for `base_url` (e.g. `http://192.168.1.249:8080`).
    pub fn new(base_url: &str, backend: Backend, timeout: Duration) -> Result<Self> {
        Self::with_client(base_url, backend, timeout, Client::new())
    }

    pub fn with_client(
        base_url: &str,
        backend: Backend,
        timeout: Duration,
        client: Client,
    ) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(Error::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {}",
                base_url
            )));
        }
        let base_url = Url::parse(trimmed).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            backend,
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.api_base_url,
            config.backend(),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn list(&self, filter: &TelemetryFilter) -> Result<Vec<Value>> {
        let route = self.backend.plan_list(filter)?;
        let records = self.fetch_records(&route).await?;
        debug!(count = records.len(), path = %route.path(), "Fetched records");
        Ok(records)
    }

    /// The newest `limit` records. Accepts either a list or a single record.
    pub async fn latest(&self, limit: usize) -> Result<Vec<Value>> {
        let route = self.backend.plan_latest(limit);
        match self.send(&route, None).await? {
            Some(Value::Object(obj)) => Ok(vec![Value::Object(obj)]),
            other => into_records(other),
        }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Value> {
        let route = self.backend.plan_get(id);
        self.send(&route, None)
            .await?
            .ok_or_else(|| Error::Decode(format!("empty body for {}", route.path())))
    }

    pub async fn create(&self, payload: &ReadingPayload) -> Result<Value> {
        let body = self.backend.encode_payload(payload);
        let route = self.backend.plan_create();
        Ok(self.send(&route, Some(&body)).await?.unwrap_or(Value::Null))
    }

    pub async fn replace(&self, id: i64, payload: &ReadingPayload) -> Result<Value> {
        let body = self.backend.encode_payload(payload);
        let route = self.backend.plan_replace(id);
        Ok(self.send(&route, Some(&body)).await?.unwrap_or(Value::Null))
    }

    pub async fn patch(&self, id: i64, payload: &ReadingPayload) -> Result<Value> {
        let route = self.backend.plan_patch(id)?;
        let body = self.backend.encode_payload(payload);
        Ok(self.send(&route, Some(&body)).await?.unwrap_or(Value::Null))
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let route = self.backend.plan_delete(id);
        self.send(&route, None).await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<Value> {
        let route = self.backend.plan_health();
        Ok(self.send(&route, None).await?.unwrap_or(Value::Null))
    }

    pub async fn is_reachable(&self) -> bool {
        self.health().await.is_ok()
    }

    /// Records with the light on.
    pub async fn light_detected(&self) -> Result<Vec<Value>> {
        self.fetch_records(&self.backend.plan_light_detected()).await
    }

    pub async fn total_records(&self) -> Result<u64> {
        match self.backend.plan_total_records() {
            Some(route) => {
                let body = self.send(&route, None).await?.unwrap_or(Value::Null);
                stat_field(&body, &["total_records", "total"])
                    .map(|n| n as u64)
                    .ok_or_else(|| Error::Decode("missing total_records".to_string()))
            }
            None => Ok(self.fetch_records(&self.backend.plan_all()).await?.len() as u64),
        }
    }

    pub async fn max_temperature(&self, range: &DateRange) -> Result<Option<f64>> {
        match self.backend.plan_range_stat("temperature-max", range)? {
            Some(route) => {
                let body = self.send(&route, None).await?.unwrap_or(Value::Null);
                Ok(stat_field(&body, &["max_temperature"]))
            }
            None => {
                let records = self.records_in(range).await?;
                Ok(records
                    .iter()
                    .filter_map(|r| normalize(r).temperature)
                    .fold(None, |max: Option<f64>, t| Some(max.map_or(t, |m| m.max(t)))))
            }
        }
    }

    pub async fn average_humidity(&self, range: &DateRange) -> Result<Option<f64>> {
        match self.backend.plan_range_stat("humidity-avg", range)? {
            Some(route) => {
                let body = self.send(&route, None).await?.unwrap_or(Value::Null);
                Ok(stat_field(&body, &["average_humidity"]))
            }
            None => {
                let values: Vec<f64> = self
                    .records_in(range)
                    .await?
                    .iter()
                    .filter_map(|r| normalize(r).humidity)
                    .collect();
                if values.is_empty() {
                    return Ok(None);
                }
                Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
            }
        }
    }

    async fn records_in(&self, range: &DateRange) -> Result<Vec<Value>> {
        let records = self.fetch_records(&self.backend.plan_all()).await?;
        if range.is_empty() {
            return Ok(records);
        }
        Ok(range_filter(range)?.apply(records))
    }

    async fn fetch_records(&self, route: &Route) -> Result<Vec<Value>> {
        let records = into_records(self.send(route, None).await?)?;
        Ok(match &route.client_filter {
            Some(filter) => filter.apply(records),
            None => records,
        })
    }

    fn url_for(&self, route: &Route) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(&route.segments);
        if !route.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(route.query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// Send one request and return the unwrapped JSON body, `None` for empty bodies.
    async fn send(&self, route: &Route, body: Option<&Value>) -> Result<Option<Value>> {
        let url = self.url_for(route)?;
        debug!(method = %route.method, url = %url, "Sending request");

        let mut request = self
            .client
            .request(route.method.clone(), url.clone())
            .timeout(self.timeout)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify(url.as_str(), e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.classify(url.as_str(), e))?;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                resource: route.path(),
                message: server_message(&text),
            });
        }
        if !status.is_success() {
            let message = server_message(&text);
            warn!(status = status.as_u16(), message = ?message, url = %url, "API returned an error");
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| Error::Decode(format!("{} from {}", e, route.path())))?;
        Ok(Some(extract_envelope(value)))
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                url: url.to_string(),
                duration: self.timeout,
            }
        } else {
            Error::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl TelemetrySource for ApiClient {
    async fn list(&self, filter: &TelemetryFilter) -> Result<Vec<Value>> {
        ApiClient::list(self, filter).await
    }

    async fn latest(&self, limit: usize) -> Result<Vec<Value>> {
        ApiClient::latest(self, limit).await
    }

    async fn get_by_id(&self, id: i64) -> Result<Value> {
        ApiClient::get_by_id(self, id).await
    }

    async fn create(&self, payload: &ReadingPayload) -> Result<Value> {
        ApiClient::create(self, payload).await
    }

    async fn replace(&self, id: i64, payload: &ReadingPayload) -> Result<Value> {
        ApiClient::replace(self, id, payload).await
    }

    async fn patch(&self, id: i64, payload: &ReadingPayload) -> Result<Value> {
        ApiClient::patch(self, id, payload).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        ApiClient::delete(self, id).await
    }

    async fn health(&self) -> Result<Value> {
        ApiClient::health(self).await
    }
}

/// Strip `{success: true, data: ...}` wrappers. Bare values pass through, so
/// applying this twice is the same as applying it once.
pub fn extract_envelope(value: Value) -> Value {
    let mut value = value;
    while is_envelope(&value) {
        value = match value {
            Value::Object(mut obj) => obj.remove("data").unwrap_or(Value::Null),
            other => other,
        };
    }
    value
}

fn is_envelope(value: &Value) -> bool {
    value.get("success") == Some(&Value::Bool(true))
        && value.get("data").is_some_and(|data| !data.is_null())
}

fn into_records(value: Option<Value>) -> Result<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => {
            let detail = other
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| "expected a list of records".to_string());
            Err(Error::Decode(detail))
        }
    }
}

/// `message` (or `error`) from a JSON error body.
fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(String::from)
}

fn stat_field(body: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| body.get(*key))
        .find_map(decode_number)
}
