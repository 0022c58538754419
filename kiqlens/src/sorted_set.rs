use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, str::FromStr};

use crate::{
    KiqlensError,
    broker_version::BrokerVersion,
    coerce::{self, detect_timestamp_format},
    job_payload::JobPayload,
    json::{decrement_number, safe_parse_json},
};

/// Number of entries popped per round trip by the bulk mutators.
pub(crate) const BULK_BATCH_SIZE: usize = 100;

/// The three time-ordered job sets kept by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortedSet {
    /// Jobs waiting for their next retry attempt.
    Retry,
    /// Jobs enqueued to run in the future.
    Schedule,
    /// Jobs that exhausted their retries.
    Dead,
}

impl SortedSet {
    pub const ALL: [Self; 3] = [Self::Retry, Self::Schedule, Self::Dead];

    pub fn key(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Schedule => "schedule",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for SortedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for SortedSet {
    type Err = KiqlensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" | "retries" => Ok(Self::Retry),
            "schedule" | "scheduled" => Ok(Self::Schedule),
            "dead" | "morgue" => Ok(Self::Dead),
            other => Err(KiqlensError::InvalidArgument(format!(
                "unknown sorted set: {other}"
            ))),
        }
    }
}

/// A job stored in a sorted set together with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortedEntry {
    pub payload: JobPayload,
    /// Point in time, in epoch seconds.
    pub score: f64,
}

impl SortedEntry {
    pub fn new(payload: JobPayload, score: f64) -> Self {
        Self { payload, score }
    }

    pub(crate) fn from_member(member: String, score: f64) -> Self {
        Self::new(JobPayload::new(member, String::new()), score)
    }

    /// The score as an instant.
    pub fn at(&self) -> Option<DateTime<Utc>> {
        coerce::epoch_to_time(self.score)
    }
}

/// Lowest and highest scored members of a non-empty set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortedSetBounds {
    pub first: SortedEntry,
    pub last: SortedEntry,
}

/// Rejects entries that carry nothing to remove or move.
pub(crate) fn ensure_payload(entry: &SortedEntry) -> Result<(), KiqlensError> {
    if entry.payload.raw().is_empty() {
        return Err(KiqlensError::InvalidArgument("payload is empty".to_string()));
    }
    Ok(())
}

/// A sorted-set job rewritten for pushing onto its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Requeue {
    pub(crate) queue: String,
    pub(crate) payload: String,
}

/// Rewrites a raw sorted-set payload so it can be pushed onto its queue.
///
/// Untouched fields keep their exact text. `at` is removed, `enqueued_at` is
/// set to `now` (and `created_at` too when missing) in the timestamp format
/// the payload already uses.
pub(crate) fn requeue_payload(
    raw: &str,
    version: BrokerVersion,
    now: DateTime<Utc>,
    decrement_retry_count: bool,
) -> Result<Requeue, KiqlensError> {
    let mut item = safe_parse_json(raw)?;
    let queue = item
        .get("queue")
        .and_then(coerce::to_string)
        .filter(|queue| !queue.is_empty())
        .ok_or_else(|| KiqlensError::Malformed("missing queue".to_string()))?;
    let format = detect_timestamp_format(&item, version);

    if decrement_retry_count
        && let Some(retry_count) = item.get("retry_count").and_then(decrement_number)
    {
        item.insert("retry_count".to_string(), retry_count);
    }
    item.shift_remove("at");
    if !item.contains_key("created_at") {
        item.insert("created_at".to_string(), format.to_value(now));
    }
    item.insert("enqueued_at".to_string(), format.to_value(now));

    Ok(Requeue {
        queue,
        payload: serde_json::to_string(&item)?,
    })
}

/// Wraps a bare search term as `*term*`; patterns with a `*` pass through.
pub(crate) fn scan_pattern(term: &str) -> String {
    if term.is_empty() {
        "*".to_string()
    } else if term.contains('*') {
        term.to_string()
    } else {
        format!("*{term}*")
    }
}

/// ZRANGE bounds for a page of `count` members starting at `start`;
/// a non-positive count reads to the end.
pub(crate) fn range_bounds(start: usize, count: isize) -> (isize, isize) {
    let start = isize::try_from(start).unwrap_or(isize::MAX);
    let stop = if count <= 0 {
        -1
    } else {
        start.saturating_add(count).saturating_sub(1)
    };
    (start, stop)
}

pub(crate) fn sort_by_score(entries: &mut [SortedEntry], reverse: bool) {
    entries.sort_by(|a, b| {
        let ordering = a.score.total_cmp(&b.score);
        if reverse { ordering.reverse() } else { ordering }
    });
}

/// Score used when a job is moved into a set "now": seconds with
/// microsecond resolution.
pub(crate) fn now_score(now: DateTime<Utc>) -> f64 {
    now.timestamp_micros() as f64 / 1_000_000.0
}
