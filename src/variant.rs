//! The two backend schemas and how each operation maps onto them.
//!
//! `sensor-data` wraps payloads in `{success, data}` envelopes and exposes
//! dedicated endpoints for tag and date-range lookups. `telemetry` returns bare
//! records and takes `uid`/`from`/`to` query parameters, so its results are also
//! filtered client-side.

use chrono::{DateTime, Local, NaiveDate, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::normalize::{local_millis, normalize, parse_timestamp_millis};
use crate::types::{DateRange, LightState, ReadingPayload, TelemetryFilter};

pub const SENSOR_DATA_RESOURCE: &str = "/api/sensor-data";
pub const TELEMETRY_RESOURCE: &str = "/api/telemetry";

/// Zone-less; the sensor-data server reads it as its own local time.
const SERVER_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ApiVariant {
    /// Enveloped, resource-oriented API (`/api/sensor-data`).
    SensorData,
    /// Bare, query-filtered API (`/api/telemetry`).
    Telemetry,
}

impl ApiVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ApiVariant::SensorData => "sensor-data",
            ApiVariant::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for ApiVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ApiVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensor-data" | "a" => Ok(ApiVariant::SensorData),
            "telemetry" | "b" => Ok(ApiVariant::Telemetry),
            other => Err(format!("unknown API variant '{}'", other)),
        }
    }
}

/// How the store obtains the "current latest" reading.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LatestStrategy {
    /// First element of the freshly sorted history.
    Derive,
    /// Separate call to the latest endpoint.
    Fetch,
}

impl FromStr for LatestStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "derive" => Ok(LatestStrategy::Derive),
            "fetch" => Ok(LatestStrategy::Fetch),
            other => Err(format!("unknown latest strategy '{}'", other)),
        }
    }
}

/// A planned request, relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub method: Method,
    /// Unencoded path segments; the client percent-encodes them.
    pub segments: Vec<String>,
    pub query: Vec<(&'static str, String)>,
    /// Applied to the returned records when the server may not have filtered.
    pub client_filter: Option<ClientFilter>,
}

impl Route {
    fn new(method: Method, resource: &str) -> Self {
        Self {
            method,
            segments: resource
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            query: Vec::new(),
            client_filter: None,
        }
    }

    fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    fn param(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    fn filtered(mut self, filter: ClientFilter) -> Self {
        self.client_filter = Some(filter);
        self
    }

    /// Path as it would appear before percent-encoding, e.g. `/api/sensor-data/7`.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Predicate over raw records, evaluated on their normalized form.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFilter {
    /// Case-insensitive substring match on the tag.
    Tag(String),
    /// Inclusive bounds in epoch milliseconds. Readings without a parseable
    /// timestamp never match.
    Range { start: Option<i64>, end: Option<i64> },
    LightOn,
}

impl ClientFilter {
    pub fn matches(&self, raw: &Value) -> bool {
        let reading = normalize(raw);
        match self {
            ClientFilter::Tag(needle) => reading
                .tag
                .map(|tag| tag.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            ClientFilter::Range { start, end } => {
                if reading.has_unknown_time() {
                    return false;
                }
                let at = reading.parsed_timestamp_millis;
                start.map_or(true, |s| at >= s) && end.map_or(true, |e| at <= e)
            }
            ClientFilter::LightOn => reading.light_state == LightState::On,
        }
    }

    pub fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

/// A backend variant bound to its resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub variant: ApiVariant,
    pub resource: String,
}

impl Backend {
    pub fn sensor_data() -> Self {
        Self {
            variant: ApiVariant::SensorData,
            resource: SENSOR_DATA_RESOURCE.to_string(),
        }
    }

    pub fn telemetry(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let resource = resource.trim_end_matches('/');
        Self {
            variant: ApiVariant::Telemetry,
            resource: if resource.is_empty() {
                TELEMETRY_RESOURCE.to_string()
            } else {
                resource.to_string()
            },
        }
    }

    pub fn default_latest_strategy(&self) -> LatestStrategy {
        match self.variant {
            ApiVariant::SensorData => LatestStrategy::Fetch,
            ApiVariant::Telemetry => LatestStrategy::Derive,
        }
    }

    fn route(&self, method: Method) -> Route {
        Route::new(method, &self.resource)
    }

    /// History request for a filter set. A tag wins over a date range, and a
    /// date range wins over the unfiltered list.
    pub fn plan_list(&self, filter: &TelemetryFilter) -> Result<Route> {
        let tag = filter.tag();
        let range = &filter.range;

        match self.variant {
            ApiVariant::SensorData => {
                if let Some(tag) = tag {
                    return Ok(self.route(Method::GET).segment("rfid").segment(tag));
                }
                if range.is_closed() {
                    let (start, end) = server_range(range)?;
                    return Ok(self
                        .route(Method::GET)
                        .segment("date-range")
                        .param("startDate", start)
                        .param("endDate", end));
                }
                if !range.is_empty() {
                    let (start, end) = range_bounds(range)?;
                    return Ok(self
                        .route(Method::GET)
                        .filtered(ClientFilter::Range { start, end }));
                }
                Ok(self.route(Method::GET))
            }
            ApiVariant::Telemetry => {
                let mut route = self.route(Method::GET);
                if let Some(tag) = tag {
                    route = route
                        .param("uid", tag)
                        .filtered(ClientFilter::Tag(tag.to_string()));
                } else if !range.is_empty() {
                    let (start, end) = range_bounds(range)?;
                    if let Some(from) = &range.from {
                        route = route.param("from", from.clone());
                    }
                    if let Some(to) = &range.to {
                        route = route.param("to", to.clone());
                    }
                    route = route.filtered(ClientFilter::Range { start, end });
                }
                Ok(route
                    .param("limit", filter.limit.to_string())
                    .param("sort", filter.sort.as_str()))
            }
        }
    }

    /// Every record, with no server-side filtering or paging.
    pub fn plan_all(&self) -> Route {
        self.route(Method::GET)
    }

    pub fn plan_latest(&self, limit: usize) -> Route {
        let limit = limit.max(1);
        match self.variant {
            ApiVariant::SensorData => self
                .route(Method::GET)
                .segment("latest")
                .segment(limit.to_string()),
            ApiVariant::Telemetry => self
                .route(Method::GET)
                .segment("latest")
                .param("limit", limit.to_string()),
        }
    }

    pub fn plan_get(&self, id: i64) -> Route {
        self.route(Method::GET).segment(id.to_string())
    }

    pub fn plan_create(&self) -> Route {
        self.route(Method::POST)
    }

    pub fn plan_replace(&self, id: i64) -> Route {
        self.route(Method::PUT).segment(id.to_string())
    }

    pub fn plan_patch(&self, id: i64) -> Result<Route> {
        match self.variant {
            ApiVariant::SensorData => Err(Error::Unsupported {
                operation: "patch",
                variant: self.variant.name(),
            }),
            ApiVariant::Telemetry => Ok(self.route(Method::PATCH).segment(id.to_string())),
        }
    }

    pub fn plan_delete(&self, id: i64) -> Route {
        self.route(Method::DELETE).segment(id.to_string())
    }

    pub fn plan_health(&self) -> Route {
        self.route(Method::GET).segment("health")
    }

    pub fn plan_light_detected(&self) -> Route {
        match self.variant {
            ApiVariant::SensorData => self.route(Method::GET).segment("light-detected"),
            ApiVariant::Telemetry => self.route(Method::GET).filtered(ClientFilter::LightOn),
        }
    }

    /// `None` when the variant has no stats endpoint and the count is computed locally.
    pub fn plan_total_records(&self) -> Option<Route> {
        match self.variant {
            ApiVariant::SensorData => Some(
                self.route(Method::GET)
                    .segment("stats")
                    .segment("total-records"),
            ),
            ApiVariant::Telemetry => None,
        }
    }

    /// Server-side aggregate over a closed range (`temperature-max`, `humidity-avg`).
    pub fn plan_range_stat(&self, stat: &'static str, range: &DateRange) -> Result<Option<Route>> {
        match self.variant {
            ApiVariant::SensorData => {
                if !range.is_closed() {
                    return Err(Error::Validation(format!(
                        "{} needs both a start and an end date",
                        stat
                    )));
                }
                let (start, end) = server_range(range)?;
                Ok(Some(
                    self.route(Method::GET)
                        .segment("stats")
                        .segment(stat)
                        .param("startDate", start)
                        .param("endDate", end),
                ))
            }
            ApiVariant::Telemetry => Ok(None),
        }
    }

    /// Request body in the variant's field names; absent fields are omitted.
    pub fn encode_payload(&self, payload: &ReadingPayload) -> Value {
        let mut body = Map::new();
        match self.variant {
            ApiVariant::SensorData => {
                put(&mut body, "ultima_tarjeta_rfid", payload.tag.clone().map(Value::from));
                put(&mut body, "temperatura", payload.temperature.map(Value::from));
                put(&mut body, "humedad", payload.humidity.map(Value::from));
                put(&mut body, "luzDetectada", payload.light.map(Value::from));
                put(
                    &mut body,
                    "timestamp",
                    payload
                        .timestamp
                        .as_deref()
                        .and_then(parse_timestamp_millis)
                        .map(Value::from),
                );
            }
            ApiVariant::Telemetry => {
                put(&mut body, "uid", payload.tag.clone().map(Value::from));
                put(&mut body, "temp", payload.temperature.map(Value::from));
                put(&mut body, "hum", payload.humidity.map(Value::from));
                put(&mut body, "luz", payload.light.map(|on| Value::from(on as u8)));
                put(&mut body, "datetime", payload.timestamp.clone().map(Value::from));
            }
        }
        Value::Object(body)
    }
}

fn put(body: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        body.insert(key.to_string(), value);
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Start,
    End,
}

/// Milliseconds for a filter bound. Bare dates cover the whole local day.
fn bound_millis(value: &str, edge: Edge) -> Result<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d") {
        let time = match edge {
            Edge::Start => date.and_hms_milli_opt(0, 0, 0, 0),
            Edge::End => date.and_hms_milli_opt(23, 59, 59, 999),
        };
        if let Some(naive) = time {
            return Ok(local_millis(naive));
        }
    }
    parse_timestamp_millis(value)
        .ok_or_else(|| Error::Validation(format!("unrecognized date '{}'", value)))
}

fn range_bounds(range: &DateRange) -> Result<(Option<i64>, Option<i64>)> {
    let start = range
        .from
        .as_deref()
        .map(|v| bound_millis(v, Edge::Start))
        .transpose()?;
    let end = range
        .to
        .as_deref()
        .map(|v| bound_millis(v, Edge::End))
        .transpose()?;
    Ok((start, end))
}

/// Local inclusive filter for a date range.
pub fn range_filter(range: &DateRange) -> Result<ClientFilter> {
    let (start, end) = range_bounds(range)?;
    Ok(ClientFilter::Range { start, end })
}

fn server_range(range: &DateRange) -> Result<(String, String)> {
    let (start, end) = range_bounds(range)?;
    let format = |ms: Option<i64>| {
        ms.and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.with_timezone(&Local).format(SERVER_DATE_FORMAT).to_string())
            .ok_or_else(|| Error::Validation("date range needs both bounds".to_string()))
    };
    Ok((format(start)?, format(end)?))
}
