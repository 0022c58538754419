//! Execution metrics rolled up by the broker per minute (or per ten minutes).

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::coerce;

/// Upper bound of each execution-time histogram bucket, fastest first.
pub const HISTOGRAM_LABELS: [&str; 26] = [
    "20ms", "30ms", "45ms", "65ms", "100ms", "150ms", "225ms", "335ms", "500ms", "750ms", "1.1s",
    "1.7s", "2.5s", "3.8s", "5.75s", "8.5s", "13s", "20s", "30s", "45s", "65s", "100s", "150s",
    "225s", "335s", "∞",
];

pub(crate) const HISTOGRAM_BUCKETS: usize = HISTOGRAM_LABELS.len();

const MAX_MINUTES: u32 = 480;
const MAX_HOURS: u32 = 72;
const DEFAULT_MINUTES: u32 = 60;

/// How far back a metrics query looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricsPeriod {
    /// Minutely buckets, 1 to 480 of them.
    Minutes(u32),
    /// Ten-minute buckets, six per hour, 1 to 72 hours.
    Hours(u32),
}

impl Default for MetricsPeriod {
    fn default() -> Self {
        Self::Minutes(DEFAULT_MINUTES)
    }
}

impl MetricsPeriod {
    /// Parses the period keys offered to the operator (`"1h"` … `"72h"`,
    /// or `"<n>m"`). Periods up to eight hours are read minute by minute.
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim();
        if let Some(hours) = key.strip_suffix('h') {
            let hours: u32 = hours.parse().ok().filter(|h| *h > 0)?;
            if hours.saturating_mul(60) <= MAX_MINUTES {
                Some(Self::Minutes(hours * 60))
            } else {
                Some(Self::Hours(hours.min(MAX_HOURS)))
            }
        } else if let Some(minutes) = key.strip_suffix('m') {
            let minutes: u32 = minutes.parse().ok().filter(|m| *m > 0)?;
            Some(Self::Minutes(minutes.min(MAX_MINUTES)))
        } else {
            None
        }
    }

    pub fn key(self) -> String {
        match self {
            Self::Minutes(m) if m % 60 == 0 => format!("{}h", m / 60),
            Self::Minutes(m) => format!("{m}m"),
            Self::Hours(h) => format!("{h}h"),
        }
    }

    pub fn granularity(self) -> Granularity {
        match self {
            Self::Minutes(_) => Granularity::Minutely,
            Self::Hours(_) => Granularity::Hourly,
        }
    }

    /// Number of buckets to read.
    pub fn bucket_count(self) -> usize {
        match self {
            Self::Minutes(m) => m.clamp(1, MAX_MINUTES) as usize,
            Self::Hours(h) => h.clamp(1, MAX_HOURS) as usize * 6,
        }
    }
}

/// Width of one rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minutely,
    /// Ten-minute buckets.
    Hourly,
}

impl Granularity {
    pub fn stride(self) -> TimeDelta {
        match self {
            Self::Minutely => TimeDelta::minutes(1),
            Self::Hourly => TimeDelta::minutes(10),
        }
    }
}

/// Start of the bucket containing `at`: the minute for minutely buckets,
/// the ten-minute boundary for hourly ones.
pub fn bucket_time(at: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    let step = granularity.stride().num_seconds();
    let secs = at.timestamp();
    DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(at)
}

/// Bucket label used as the key of per-bucket results.
pub fn bucket_label(at: DateTime<Utc>, granularity: Granularity) -> String {
    bucket_time(at, granularity).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The buckets a period covers, newest first.
#[derive(Debug, Clone)]
pub(crate) struct BucketPlan {
    pub(crate) granularity: Granularity,
    pub(crate) times: Vec<DateTime<Utc>>,
    pub(crate) starts_at: DateTime<Utc>,
    pub(crate) ends_at: DateTime<Utc>,
}

impl BucketPlan {
    pub(crate) fn new(period: MetricsPeriod, now: DateTime<Utc>) -> Self {
        let granularity = period.granularity();
        let stride = granularity.stride();
        let newest = bucket_time(now, granularity);
        let times: Vec<DateTime<Utc>> = (0..period.bucket_count())
            .map(|i| newest - stride * i as i32)
            .collect();
        let oldest = times.last().copied().unwrap_or(newest);
        Self {
            granularity,
            times,
            starts_at: oldest + stride,
            ends_at: now,
        }
    }
}

/// Totals for one job class over some set of buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsJobTotals {
    pub processed: i64,
    pub failed: i64,
    pub milliseconds: i64,
}

impl MetricsJobTotals {
    pub fn seconds(&self) -> f64 {
        self.milliseconds as f64 / 1_000.0
    }

    pub fn success(&self) -> i64 {
        (self.processed - self.failed).max(0)
    }

    /// Average execution time of successful runs.
    pub fn avg_seconds(&self) -> f64 {
        let success = self.success();
        if success > 0 {
            (self.seconds() / success as f64).max(0.0)
        } else {
            0.0
        }
    }

    /// Adds a rollup metric (`p`, `f` or `ms`). Unknown metrics are ignored.
    pub(crate) fn add(&mut self, metric: &str, value: i64) {
        match metric {
            "p" => self.processed += value,
            "f" => self.failed += value,
            "ms" => self.milliseconds += value,
            _ => {}
        }
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.milliseconds += other.milliseconds;
    }
}

/// Execution time distribution for one bucket, fastest bucket first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsHistogram {
    counts: [u16; HISTOGRAM_BUCKETS],
}

impl MetricsHistogram {
    /// Builds a histogram from the broker's counters, which are stored
    /// slowest bucket first.
    pub(crate) fn from_broker(values: &[Option<i64>]) -> Self {
        let mut counts = [0u16; HISTOGRAM_BUCKETS];
        for (slot, value) in counts.iter_mut().zip(values.iter()) {
            *slot = value
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or_default();
        }
        counts.reverse();
        Self { counts }
    }

    pub fn counts(&self) -> &[u16; HISTOGRAM_BUCKETS] {
        &self.counts
    }

    pub fn labels(&self) -> &'static [&'static str; HISTOGRAM_BUCKETS] {
        &HISTOGRAM_LABELS
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| u64::from(*c)).sum()
    }
}

/// Per-class totals for the busiest job classes.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsTopJobs {
    pub granularity: Granularity,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub jobs: BTreeMap<String, MetricsJobTotals>,
}

impl MetricsTopJobs {
    /// Classes ordered by total execution time, slowest first.
    pub fn sorted(&self) -> Vec<(&str, &MetricsJobTotals)> {
        let mut jobs: Vec<(&str, &MetricsJobTotals)> =
            self.jobs.iter().map(|(k, v)| (k.as_str(), v)).collect();
        jobs.sort_by(|a, b| {
            b.1.milliseconds
                .cmp(&a.1.milliseconds)
                .then_with(|| a.0.cmp(b.0))
        });
        jobs
    }
}

/// One bucket of a single class's metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsBucket {
    pub totals: MetricsJobTotals,
    /// Only read for minutely buckets.
    pub histogram: Option<MetricsHistogram>,
}

/// Metrics of one job class over a period, bucket by bucket.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsJobDetail {
    pub class: String,
    pub granularity: Granularity,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub totals: MetricsJobTotals,
    /// Keyed by [`bucket_label`].
    pub buckets: BTreeMap<String, MetricsBucket>,
}

/// Folds rollup hashes (`<class>|<metric>` → count) into per-class totals,
/// keeping only classes containing `filter` (case-insensitive) when set.
pub(crate) fn aggregate_rollups<I>(hashes: I, filter: Option<&str>) -> BTreeMap<String, MetricsJobTotals>
where
    I: IntoIterator<Item = HashMap<String, String>>,
{
    let filter = filter
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_lowercase);
    let mut jobs: BTreeMap<String, MetricsJobTotals> = BTreeMap::new();

    for hash in hashes {
        for (field, value) in hash {
            let Some((class, metric)) = field.split_once('|') else {
                continue;
            };
            if let Some(filter) = &filter
                && !class.to_lowercase().contains(filter.as_str())
            {
                continue;
            }
            let Some(value) = coerce::str_to_i64(&value) else {
                continue;
            };
            jobs.entry(class.to_string()).or_default().add(metric, value);
        }
    }

    jobs
}

/// Totals from an `HMGET <key> ms p f` reply.
pub(crate) fn totals_from_fields(fields: &[Option<String>]) -> MetricsJobTotals {
    let value = |i: usize| {
        fields
            .get(i)
            .and_then(Option::as_deref)
            .and_then(coerce::str_to_i64)
            .unwrap_or_default()
    };
    MetricsJobTotals {
        milliseconds: value(0),
        processed: value(1),
        failed: value(2),
    }
}
