//! Permissive decoding of broker-side values.
//!
//! The broker writes numbers as JSON numbers, as strings, and sometimes as
//! both within one deployment. Everything above this module works with typed
//! options and never inspects a raw [`Value`] variant itself.

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};

use crate::broker_version::BrokerVersion;

/// Epoch values above this are milliseconds, below are seconds.
pub(crate) const MILLIS_THRESHOLD: f64 = 1e12;

/// Fields inspected, in order, to decide how a payload writes its timestamps.
const TIMESTAMP_FIELDS: [&str; 4] = ["enqueued_at", "created_at", "failed_at", "retried_at"];

pub fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => number_to_i64(n),
        Value::String(s) => str_to_i64(s),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => str_to_f64(s),
        _ => None,
    }
}

pub fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => str_to_bool(s),
        Value::Number(n) => match number_to_i64(n) {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

pub fn to_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(epoch_to_time),
        Value::String(s) => str_to_time(s),
        _ => None,
    }
}

pub fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn str_to_i64(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
}

pub fn str_to_f64(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

pub fn str_to_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn str_to_time(s: &str) -> Option<DateTime<Utc>> {
    if let Some(epoch) = str_to_f64(s) {
        return epoch_to_time(epoch);
    }
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Epoch number to an instant, reading values above 10^12 as milliseconds.
pub fn epoch_to_time(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() {
        return None;
    }
    let micros = if epoch > MILLIS_THRESHOLD {
        epoch * 1_000.0
    } else {
        epoch * 1_000_000.0
    };
    DateTime::<Utc>::from_timestamp_micros(micros.round() as i64)
}

fn number_to_i64(n: &Number) -> Option<i64> {
    n.as_i64()
        .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
        .or_else(|| n.as_f64().and_then(integral_f64))
}

fn integral_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// How a payload writes its epoch timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// Float seconds with microsecond fraction, e.g. `1700000000.123456`.
    Seconds,
    /// Integer milliseconds, e.g. `1700000000123`.
    Milliseconds,
}

impl TimestampFormat {
    pub fn of_epoch(epoch: f64) -> Self {
        if epoch > MILLIS_THRESHOLD {
            Self::Milliseconds
        } else {
            Self::Seconds
        }
    }

    /// Default for payloads that carry no timestamp at all.
    pub fn default_for(version: BrokerVersion) -> Self {
        match version {
            BrokerVersion::V7 => Self::Seconds,
            BrokerVersion::V8 | BrokerVersion::Unknown => Self::Milliseconds,
        }
    }

    pub fn format(self, at: DateTime<Utc>) -> String {
        match self {
            Self::Seconds => format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros()),
            Self::Milliseconds => at.timestamp_millis().to_string(),
        }
    }

    /// JSON number whose serialised text is exactly [`TimestampFormat::format`].
    pub fn to_value(self, at: DateTime<Utc>) -> Value {
        serde_json::from_str::<Number>(&self.format(at))
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Picks the timestamp format from the first numeric timestamp field of a
/// payload, falling back to the broker version's convention.
pub fn detect_timestamp_format(item: &Map<String, Value>, version: BrokerVersion) -> TimestampFormat {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|field| item.get(*field))
        .find_map(to_f64)
        .map_or_else(|| TimestampFormat::default_for(version), TimestampFormat::of_epoch)
}
