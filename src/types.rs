use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// One normalized sensor observation, independent of the backend schema.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub tag: Option<String>,
    pub timestamp: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light_state: LightState,
    /// Sort key derived from `timestamp`; 0 when unparseable. Never persisted.
    #[serde(skip)]
    pub parsed_timestamp_millis: i64,
    /// Presentation string derived from `timestamp`. Never persisted.
    #[serde(skip)]
    pub display_timestamp: String,
    /// Fields the API sent that no rule consumed.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reading {
    /// True when the timestamp could not be placed on the time axis.
    ///
    /// Such readings sort as the epoch but should be shown as "unknown time".
    pub fn has_unknown_time(&self) -> bool {
        self.parsed_timestamp_millis == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    On,
    Off,
    #[default]
    Unknown,
}

impl LightState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LightState::On => "on",
            LightState::Off => "off",
            LightState::Unknown => "unknown",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            LightState::On => Some(true),
            LightState::Off => Some(false),
            LightState::Unknown => None,
        }
    }
}

impl fmt::Display for LightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial set of reading fields sent on create/replace/patch.
///
/// Encoded into the configured backend's field names by [`crate::variant::Backend::encode_payload`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingPayload {
    pub tag: Option<String>,
    pub timestamp: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<bool>,
}

impl ReadingPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn temperature(mut self, value: f64) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn humidity(mut self, value: f64) -> Self {
        self.humidity = Some(value);
        self
    }

    pub fn light(mut self, on: bool) -> Self {
        self.light = Some(on);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl From<&Reading> for ReadingPayload {
    fn from(reading: &Reading) -> Self {
        Self {
            tag: reading.tag.clone(),
            timestamp: reading.timestamp.clone(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            light: reading.light_state.as_bool(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// Inclusive time window. Either bound may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl DateRange {
    pub fn new(from: Option<String>, to: Option<String>) -> Self {
        Self {
            from: non_blank(from),
            to: non_blank(to),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.from.is_some() && self.to.is_some()
    }
}

/// Filter set for history fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFilter {
    pub tag: Option<String>,
    pub range: DateRange,
    pub limit: usize,
    pub sort: SortOrder,
}

pub const DEFAULT_LIMIT: usize = 50;

impl Default for TelemetryFilter {
    fn default() -> Self {
        Self {
            tag: None,
            range: DateRange::default(),
            limit: DEFAULT_LIMIT,
            sort: SortOrder::Desc,
        }
    }
}

impl TelemetryFilter {
    pub fn new(limit: usize, sort: SortOrder) -> Self {
        Self {
            limit,
            sort,
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = non_blank(Some(tag.into()));
        self
    }

    pub fn with_range(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.range = DateRange::new(from, to);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Tag to filter on, ignoring surrounding whitespace.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
