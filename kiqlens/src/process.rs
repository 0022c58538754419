//! Worker processes and the jobs they are running.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{coerce, job_payload::JobPayload};

/// How a capsule picks the next queue to fetch from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleMode {
    Strict,
    Weighted,
    Random,
    Other(String),
}

impl CapsuleMode {
    fn parse(mode: &str) -> Self {
        match mode {
            "strict" => Self::Strict,
            "weighted" => Self::Weighted,
            "random" => Self::Random,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A named group of queues with its own concurrency inside one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capsule {
    pub name: String,
    pub concurrency: i64,
    pub mode: CapsuleMode,
    /// Queue → weight, in declaration order.
    pub weights: Vec<(String, i64)>,
}

/// Snapshot of one worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Process {
    /// `<hostname>:<pid>:<nonce>`.
    pub identity: String,
    pub hostname: String,
    pub pid: u32,
    pub tag: Option<String>,
    pub labels: Vec<String>,
    pub version: Option<String>,
    pub embedded: bool,
    pub concurrency: i64,
    pub busy: i64,
    pub beat: Option<DateTime<Utc>>,
    pub quiet: bool,
    pub rss_bytes: u64,
    pub rtt_us: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub queues: Vec<String>,
    /// Top-level queue weights, or the `default` capsule's when present.
    pub weights: Vec<(String, i64)>,
    pub capsules: Vec<Capsule>,
}

impl Process {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        let (hostname, pid) = parse_identity(&identity).unwrap_or_default();
        Self {
            identity,
            hostname,
            pid,
            ..Default::default()
        }
    }

    /// Whether the `info` blob described any queues or capsules.
    pub fn is_valid(&self) -> bool {
        !self.capsules.is_empty()
    }

    /// Quiet processes fetch no new work and are about to stop.
    pub fn stopping(&self) -> bool {
        self.quiet
    }

    /// Applies the reply of `HMGET <identity> info busy beat quiet rss rtt_us`.
    pub(crate) fn apply_fields(&mut self, fields: &[Option<String>]) {
        let field = |i: usize| fields.get(i).and_then(Option::as_deref);

        if let Some(info) = field(0) {
            match serde_json::from_str::<Value>(info) {
                Ok(Value::Object(info)) => self.apply_info(&info),
                _ => tracing::warn!(identity = self.identity, "Unreadable process info"),
            }
        }
        self.busy = field(1).and_then(coerce::str_to_i64).unwrap_or_default();
        self.beat = field(2).and_then(coerce::str_to_time);
        self.quiet = field(3).and_then(coerce::str_to_bool).unwrap_or_default();
        self.rss_bytes = field(4)
            .and_then(coerce::str_to_i64)
            .and_then(|kib| u64::try_from(kib).ok())
            .map_or(0, |kib| kib.saturating_mul(1024));
        self.rtt_us = field(5).and_then(coerce::str_to_i64).unwrap_or_default();
    }

    /// Decodes the process `info` JSON.
    pub(crate) fn apply_info(&mut self, info: &Map<String, Value>) {
        if let Some(hostname) = info.get("hostname").and_then(coerce::to_string) {
            self.hostname = hostname;
        }
        if let Some(pid) = info
            .get("pid")
            .and_then(coerce::to_i64)
            .and_then(|pid| u32::try_from(pid).ok())
        {
            self.pid = pid;
        }
        if self.identity.is_empty()
            && let Some(identity) = info.get("identity").and_then(coerce::to_string)
        {
            self.identity = identity;
        }
        self.tag = info.get("tag").and_then(coerce::to_string);
        self.version = info.get("version").and_then(coerce::to_string);
        self.embedded = info
            .get("embedded")
            .and_then(coerce::to_bool)
            .unwrap_or_default();
        self.concurrency = info
            .get("concurrency")
            .and_then(coerce::to_i64)
            .unwrap_or_default();
        self.started_at = info.get("started_at").and_then(coerce::to_time);
        self.labels = match info.get("labels") {
            Some(Value::Array(labels)) => labels.iter().filter_map(coerce::to_string).collect(),
            _ => vec![],
        };

        let mut weights = Vec::new();
        self.queues = match info.get("queues") {
            Some(Value::Array(queues)) => queues
                .iter()
                .filter_map(coerce::to_string)
                .map(|entry| match entry.split_once(',') {
                    Some((name, weight)) => {
                        let name = name.trim().to_string();
                        if let Some(weight) = coerce::str_to_i64(weight) {
                            upsert_weight(&mut weights, &name, weight);
                        }
                        name
                    }
                    None => entry,
                })
                .collect(),
            _ => vec![],
        };
        if let Some(declared) = info.get("weights") {
            collect_weights(declared, &mut weights);
        }

        self.capsules = match info.get("capsules") {
            Some(Value::Object(capsules)) if !capsules.is_empty() => capsules
                .iter()
                .map(|(name, capsule)| decode_capsule(name, capsule, self.concurrency))
                .collect(),
            _ => vec![],
        };

        if self.capsules.is_empty() {
            if !self.queues.is_empty() {
                self.capsules
                    .push(default_capsule(&self.queues, &weights, self.concurrency));
            }
            self.weights = weights;
        } else {
            if let Some(default) = self.capsules.iter().find(|c| c.name == "default") {
                weights.clone_from(&default.weights);
            }
            if self.queues.is_empty() {
                for capsule in &self.capsules {
                    for (queue, _) in &capsule.weights {
                        if !self.queues.contains(queue) {
                            self.queues.push(queue.clone());
                        }
                    }
                }
            }
            self.weights = weights;
        }
    }
}

/// Splits `<hostname>:<pid>:<nonce>`, requiring a hostname and non-zero pid.
pub fn parse_identity(identity: &str) -> Option<(String, u32)> {
    let mut parts = identity.rsplitn(3, ':');
    let _nonce = parts.next()?;
    let pid: u32 = parts.next()?.parse().ok().filter(|pid| *pid != 0)?;
    let hostname = parts.next().filter(|h| !h.is_empty())?;
    Some((hostname.to_string(), pid))
}

fn upsert_weight(weights: &mut Vec<(String, i64)>, queue: &str, weight: i64) {
    match weights.iter_mut().find(|(name, _)| name == queue) {
        Some(existing) => existing.1 = weight,
        None => weights.push((queue.to_string(), weight)),
    }
}

/// Accepts both historical shapes: `[{"q": 1}, …]` and `{"q": 1}`.
fn collect_weights(value: &Value, weights: &mut Vec<(String, i64)>) {
    match value {
        Value::Array(maps) => {
            for map in maps {
                collect_weights(map, weights);
            }
        }
        Value::Object(map) => {
            for (queue, weight) in map {
                if let Some(weight) = coerce::to_i64(weight) {
                    upsert_weight(weights, queue, weight);
                }
            }
        }
        _ => {}
    }
}

fn decode_capsule(name: &str, value: &Value, process_concurrency: i64) -> Capsule {
    let mut weights = Vec::new();
    if let Some(declared) = value.get("weights") {
        collect_weights(declared, &mut weights);
    }
    Capsule {
        name: name.to_string(),
        concurrency: value
            .get("concurrency")
            .and_then(coerce::to_i64)
            .unwrap_or(process_concurrency),
        mode: value
            .get("mode")
            .and_then(coerce::to_string)
            .map_or(CapsuleMode::Strict, |mode| CapsuleMode::parse(&mode)),
        weights,
    }
}

/// The capsule implied by a process that only declares top-level queues.
fn default_capsule(queues: &[String], declared: &[(String, i64)], concurrency: i64) -> Capsule {
    let mut weights: Vec<(String, i64)> = Vec::with_capacity(queues.len());
    for queue in queues {
        let weight = declared
            .iter()
            .find(|(name, _)| name == queue)
            .map_or(0, |(_, weight)| *weight);
        upsert_weight(&mut weights, queue, weight);
    }
    let mode = if !weights.is_empty() && weights.iter().all(|(_, weight)| *weight == 1) {
        CapsuleMode::Random
    } else {
        CapsuleMode::Strict
    };
    Capsule {
        name: "default".to_string(),
        concurrency,
        mode,
        weights,
    }
}

/// A job currently executing on some process thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveJob {
    /// Identity of the owning process.
    pub process: String,
    pub thread_id: String,
    pub queue: String,
    pub run_at: Option<DateTime<Utc>>,
    pub payload: JobPayload,
}

impl ActiveJob {
    /// Decodes one `<identity>:work` entry: `{queue, payload, run_at}` where
    /// `payload` is either a nested JSON string or an inline object.
    pub(crate) fn decode(process: &str, thread_id: &str, raw: &str) -> Option<Self> {
        let Ok(Value::Object(work)) = serde_json::from_str::<Value>(raw) else {
            return None;
        };
        let queue = work
            .get("queue")
            .and_then(coerce::to_string)
            .unwrap_or_default();
        let payload = match work.get("payload")? {
            Value::String(nested) => nested.clone(),
            Value::Object(inline) => serde_json::to_string(inline).ok()?,
            _ => return None,
        };
        Some(Self {
            process: process.to_string(),
            thread_id: thread_id.to_string(),
            run_at: work.get("run_at").and_then(coerce::to_time),
            payload: JobPayload::new(payload, queue.clone()),
            queue,
        })
    }
}

/// Live processes and everything they are running.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusyData {
    pub processes: Vec<Process>,
    /// Oldest `run_at` first.
    pub jobs: Vec<ActiveJob>,
}
