//! Conversion of raw API records into [`Reading`] values.
//!
//! Both backend schemas (and the canonical shape written to the local cache)
//! are described by one rule table, [`RULES`]. For every target field the
//! source keys are tried in order and the first one whose value decodes wins.
//! Supporting another schema means adding its key names to the table.
//!
//! Normalization never fails: absent or malformed data becomes `None` or
//! [`LightState::Unknown`], and an unparseable timestamp yields
//! `parsed_timestamp_millis == 0` so that history still has a total order.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::types::{LightState, Reading};

/// Source keys per canonical field, in resolution order.
#[derive(Debug, Clone, Copy)]
pub struct FieldRules {
    pub id: &'static [&'static str],
    pub tag: &'static [&'static str],
    pub timestamp: &'static [&'static str],
    pub temperature: &'static [&'static str],
    pub humidity: &'static [&'static str],
    pub light: &'static [&'static str],
}

pub const RULES: FieldRules = FieldRules {
    id: &["id"],
    tag: &[
        "uid",
        "ultima_tarjeta_rfid",
        "ultimaTarjetaRfid",
        "rfidTag",
        "rfid_tag",
        "tag",
    ],
    timestamp: &[
        "datetime",
        "date",
        "fechaCreacion",
        "fecha_creacion",
        "received_at",
        "timestamp",
        "time",
    ],
    temperature: &["temp", "temperatura", "temperature"],
    humidity: &["hum", "humedad", "humidity"],
    light: &["luzDetectada", "luz_detectada", "luz", "lightState"],
};

/// Shown when a reading carries no timestamp at all.
pub const MISSING_TIMESTAMP: &str = "—";

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl FieldRules {
    fn claims(&self, key: &str) -> bool {
        [
            self.id,
            self.tag,
            self.timestamp,
            self.temperature,
            self.humidity,
            self.light,
        ]
        .iter()
        .any(|keys| keys.contains(&key))
    }
}

pub fn normalize(raw: &Value) -> Reading {
    normalize_with(&RULES, raw)
}

pub fn normalize_with(rules: &FieldRules, raw: &Value) -> Reading {
    let Some(obj) = raw.as_object() else {
        return Reading {
            display_timestamp: MISSING_TIMESTAMP.to_string(),
            ..Reading::default()
        };
    };

    let (timestamp, parsed_timestamp_millis, display_timestamp) =
        match resolve(obj, rules.timestamp, decode_timestamp) {
            Some(ts) => (Some(ts.canonical), ts.millis.unwrap_or(0), ts.display),
            None => (None, 0, MISSING_TIMESTAMP.to_string()),
        };

    let extra: Map<String, Value> = obj
        .iter()
        .filter(|(key, _)| !rules.claims(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Reading {
        id: resolve(obj, rules.id, decode_id),
        tag: resolve(obj, rules.tag, decode_text),
        timestamp,
        temperature: resolve(obj, rules.temperature, decode_number),
        humidity: resolve(obj, rules.humidity, decode_number),
        light_state: resolve(obj, rules.light, decode_light).unwrap_or_default(),
        parsed_timestamp_millis,
        display_timestamp,
        extra,
    }
}

/// Normalize a list of raw records and order it most-recent-first.
pub fn normalize_history(records: &[Value]) -> Vec<Reading> {
    let mut readings: Vec<Reading> = records.iter().map(normalize).collect();
    sort_history(&mut readings);
    readings
}

/// Stable descending sort on the parsed timestamp; ties keep response order.
pub fn sort_history(readings: &mut [Reading]) {
    readings.sort_by(|a, b| b.parsed_timestamp_millis.cmp(&a.parsed_timestamp_millis));
}

fn resolve<T>(
    obj: &Map<String, Value>,
    keys: &[&str],
    decode: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find_map(|value| decode(value))
}

fn decode_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decode_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Any value that is not a finite number becomes `None`.
pub fn decode_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// Booleans (`luzDetectada`), integers 0/1 (`luz`) and the canonical
/// `"on"`/`"off"` strings. Anything else is left for the next key.
pub fn decode_light(value: &Value) -> Option<LightState> {
    match value {
        Value::Bool(true) => Some(LightState::On),
        Value::Bool(false) => Some(LightState::Off),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 1.0 => Some(LightState::On),
            Some(f) if f == 0.0 => Some(LightState::Off),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "true" => Some(LightState::On),
            "0" | "off" | "false" => Some(LightState::Off),
            _ => None,
        },
        _ => None,
    }
}

struct Timestamp {
    canonical: String,
    millis: Option<i64>,
    display: String,
}

fn decode_timestamp(value: &Value) -> Option<Timestamp> {
    let (raw, millis) = match value {
        Value::String(s) if !s.trim().is_empty() => (s.clone(), parse_timestamp_millis(s)),
        Value::Number(n) => (
            n.to_string(),
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f as i64)
                .filter(|ms| DateTime::<Utc>::from_timestamp_millis(*ms).is_some()),
        ),
        _ => return None,
    };

    let parsed = millis.and_then(DateTime::<Utc>::from_timestamp_millis);
    Some(match parsed {
        Some(dt) => Timestamp {
            canonical: dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            millis,
            display: dt.with_timezone(&Local).format(DISPLAY_FORMAT).to_string(),
        },
        None => Timestamp {
            canonical: raw.clone(),
            millis: None,
            display: raw,
        },
    })
}

/// Milliseconds since the epoch for the timestamp shapes seen in the wild:
/// RFC 3339, zone-less ISO date-times (local wall-clock time), bare dates
/// (UTC midnight), epoch milliseconds as text and RFC 2822.
pub fn parse_timestamp_millis(input: &str) -> Option<i64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(n) = s.parse::<f64>() {
        return n
            .is_finite()
            .then_some(n as i64)
            .filter(|ms| DateTime::<Utc>::from_timestamp_millis(*ms).is_some());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.timestamp_millis());
    }

    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(local_millis(naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc().timestamp_millis());
    }

    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Epoch milliseconds for a local wall-clock time. A time skipped by a DST
/// change has no local instant and is read as UTC.
pub fn local_millis(naive: NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| naive.and_utc().timestamp_millis())
}
