use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{KiqlensError, Storage, coerce, job_payload::JobPayload};

/// A named queue bound to the storage it was listed from.
///
/// Obtained from [`Storage::queues`] or [`Storage::queue`]; every call is a
/// fresh read against the broker.
#[derive(Clone, Serialize)]
pub struct Queue {
    name: String,
    #[serde(skip)]
    storage: Storage,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>, storage: Storage) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of jobs waiting in the queue.
    pub async fn size(&self) -> Result<usize, KiqlensError> {
        self.storage.queue_size(&self.name).await
    }

    /// Age in seconds of the oldest waiting job, `0.0` for an empty queue.
    pub async fn latency(&self) -> Result<f64, KiqlensError> {
        self.storage.queue_latency(&self.name).await
    }

    /// A page of jobs, newest first, together with the queue size.
    ///
    /// Each payload carries its position so the first job ever enqueued
    /// among those still waiting is labelled `1`.
    pub async fn jobs(
        &self,
        start: usize,
        count: usize,
    ) -> Result<(Vec<JobPayload>, usize), KiqlensError> {
        self.storage.queue_jobs(&self.name, start, count).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Latency of a queue given the raw payload at its tail.
pub(crate) fn tail_latency(tail: Option<&str>, now: DateTime<Utc>) -> f64 {
    let Some(Ok(Value::Object(item))) = tail.map(serde_json::from_str::<Value>) else {
        return 0.0;
    };
    item.get("enqueued_at")
        .and_then(coerce::to_time)
        .map_or(0.0, |at| {
            ((now - at).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0).max(0.0)
        })
}

/// Wraps a page of raw queue entries, numbering them `size - start - index`.
pub(crate) fn number_jobs(
    raws: Vec<String>,
    queue: &str,
    start: usize,
    size: usize,
) -> Vec<JobPayload> {
    raws.into_iter()
        .enumerate()
        .map(|(index, raw)| {
            JobPayload::new(raw, queue)
                .with_position(size.saturating_sub(start).saturating_sub(index))
        })
        .collect()
}
