use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::{broker_version::BrokerVersion, metrics::Granularity};

/// Centralizes the Redis key naming scheme read by `StorageInternal`.
#[derive(Clone)]
pub(crate) struct StorageKeys {
    /// String counter of jobs processed since the broker was installed.
    pub(crate) processed: String,
    /// String counter of jobs failed since the broker was installed.
    pub(crate) failed: String,
    /// Redis sorted set of jobs waiting for their next retry,
    /// scored by the retry time in epoch seconds.
    pub(crate) retry: String,
    /// Redis sorted set of jobs scheduled for the future,
    /// scored by the run time in epoch seconds.
    pub(crate) schedule: String,
    /// Redis sorted set of jobs that exhausted their retries,
    /// scored by the time they died in epoch seconds.
    pub(crate) dead: String,
    /// Redis set of live worker process identities. Each identity is also
    /// the key of a hash with `info`, `busy`, `beat`, `quiet`, `rss`, `rtt_us`.
    pub(crate) processes: String,
    /// Redis set of known queue names.
    pub(crate) queues: String,
    /// Prefix for Redis lists holding enqueued job payloads
    /// (actual keys look like `queue:<name>`, head is newest).
    pub(crate) queue_prefix: String,
}

impl StorageKeys {
    pub(crate) fn new() -> Self {
        Self {
            processed: "stat:processed".to_string(),
            failed: "stat:failed".to_string(),
            retry: "retry".to_string(),
            schedule: "schedule".to_string(),
            dead: "dead".to_string(),
            processes: "processes".to_string(),
            queues: "queues".to_string(),
            queue_prefix: "queue".to_string(),
        }
    }

    pub(crate) fn queue(&self, name: &str) -> String {
        format!("{}:{}", self.queue_prefix, name)
    }

    /// Hash of thread id → JSON describing the job the thread is running.
    pub(crate) fn work(&self, identity: &str) -> String {
        format!("{identity}:work")
    }

    /// Sorted set parking entries a bulk move could not rewrite until they
    /// are merged back into `set`.
    pub(crate) fn held(&self, set: &str) -> String {
        format!("{set}:held")
    }

    pub(crate) fn processed_on(&self, date: NaiveDate) -> String {
        format!("{}:{}", self.processed, date.format("%Y-%m-%d"))
    }

    pub(crate) fn failed_on(&self, date: NaiveDate) -> String {
        format!("{}:{}", self.failed, date.format("%Y-%m-%d"))
    }

    /// Rollup hash for one metrics bucket.
    ///
    /// V8 writes `j|YYMMDD|H:MM` per minute and `j|YYMMDD|H:T` per ten
    /// minutes (`T` = minute / 10). V7 only writes `j|YYYYMMDD|H:M`.
    pub(crate) fn rollup(
        &self,
        version: BrokerVersion,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> String {
        match (version, granularity) {
            (BrokerVersion::V7, _) => format!(
                "j|{}|{}:{}",
                at.format("%Y%m%d"),
                at.hour(),
                at.minute()
            ),
            (_, Granularity::Minutely) => format!(
                "j|{}|{}:{:02}",
                at.format("%y%m%d"),
                at.hour(),
                at.minute()
            ),
            (_, Granularity::Hourly) => format!(
                "j|{}|{}:{}",
                at.format("%y%m%d"),
                at.hour(),
                at.minute() / 10
            ),
        }
    }

    /// Bitfield of per-minute execution time histogram counters for a class.
    pub(crate) fn histogram(&self, version: BrokerVersion, class: &str, at: DateTime<Utc>) -> String {
        match version {
            BrokerVersion::V7 => format!(
                "{class}-{:02}-{:02}:{}",
                at.day(),
                at.hour(),
                at.minute()
            ),
            BrokerVersion::V8 | BrokerVersion::Unknown => format!(
                "h|{class}-{}-{}:{}",
                at.day(),
                at.hour(),
                at.minute()
            ),
        }
    }
}
