//! Dashboard counters and broker information.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;

use crate::coerce;

/// Counters shown at the top of the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Total number of jobs processed.
    pub processed: i64,
    /// Total number of jobs failed.
    pub failed: i64,
    /// Number of jobs currently executing across all processes.
    pub busy: i64,
    /// Number of jobs waiting in all queues.
    pub enqueued: i64,
    /// Number of jobs in the retry set.
    pub retries: i64,
    /// Number of jobs in the schedule set.
    pub scheduled: i64,
    /// Number of jobs in the dead set.
    pub dead: i64,
}

impl Stats {
    /// Builds stats from the stats script's reply:
    /// `[processed, failed, busy, enqueued, retries, scheduled, dead]`.
    pub(crate) fn from_script_reply(reply: &[i64]) -> Self {
        let value = |i: usize| reply.get(i).copied().unwrap_or_default().max(0);
        Self {
            processed: value(0),
            failed: value(1),
            busy: value(2),
            enqueued: value(3),
            retries: value(4),
            scheduled: value(5),
            dead: value(6),
        }
    }
}

/// Processed and failed counts per day, oldest day first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsHistory {
    pub dates: Vec<NaiveDate>,
    pub processed: Vec<i64>,
    pub failed: Vec<i64>,
}

impl StatsHistory {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Builds the history from an `MGET` reply laid out as
    /// `[processed(today), failed(today), processed(today-1), …]`,
    /// where `dates` runs from today backwards.
    pub(crate) fn from_reply(dates: &[NaiveDate], reply: &[Option<String>]) -> Self {
        let count = |i: usize| {
            reply
                .get(i)
                .and_then(Option::as_deref)
                .and_then(coerce::str_to_i64)
                .unwrap_or_default()
        };
        let mut history = Self::default();
        for (i, date) in dates.iter().enumerate().rev() {
            history.dates.push(*date);
            history.processed.push(count(i * 2));
            history.failed.push(count(i * 2 + 1));
        }
        history
    }
}

/// A few fields of the broker's `INFO` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedisInfo {
    pub version: String,
    pub uptime_days: i64,
    pub connected_clients: i64,
    pub used_memory_human: String,
    pub used_memory_peak_human: String,
}

impl RedisInfo {
    pub(crate) fn from_info(text: &str) -> Self {
        let fields = parse_info(text);
        let text_field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let int_field = |name: &str| {
            fields
                .get(name)
                .and_then(|v| coerce::str_to_i64(v))
                .unwrap_or_default()
        };
        Self {
            version: text_field("redis_version"),
            uptime_days: int_field("uptime_in_days"),
            connected_clients: int_field("connected_clients"),
            used_memory_human: text_field("used_memory_human"),
            used_memory_peak_human: text_field("used_memory_peak_human"),
        }
    }
}

/// Parses `INFO` output into `field → value`, skipping blank lines and
/// `# Section` headers.
pub(crate) fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
