use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::{io::Read, sync::OnceLock};

use crate::coerce;

/// Shown in place of the last argument of jobs enqueued with `encrypt`.
pub const ENCRYPTED_ARG: &str = "[encrypted data]";

/// Adapter classes that wrap a user job.
const WRAPPER_CLASSES: [&str; 2] = [
    "ActiveJob::QueueAdapters::SidekiqAdapter::JobWrapper",
    "Sidekiq::ActiveJob::Wrapper",
];

/// Which of the known mailer jobs a wrapped job delivers through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MailerKind {
    Delivery,
    MailDelivery,
}

impl MailerKind {
    fn from_class(class: &str) -> Option<Self> {
        match class {
            "ActionMailer::DeliveryJob" => Some(Self::Delivery),
            "ActionMailer::MailDeliveryJob" => Some(Self::MailDelivery),
            _ => None,
        }
    }
}

/// What the payload's `class` tells us about how to display it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobKind {
    Plain,
    Wrapped { class: Option<String> },
    Mailer { kind: MailerKind },
}

/// A job as stored by the broker: the raw JSON text plus its decoded map.
///
/// The raw text is kept verbatim so it can be used as a sorted-set member
/// for removal. Numbers in the decoded map keep their original text.
#[derive(Debug, Clone)]
pub struct JobPayload {
    raw: String,
    item: Map<String, Value>,
    queue: String,
    parsed: bool,
    position: Option<usize>,
    display_class: OnceLock<String>,
    display_args: OnceLock<Vec<Value>>,
    backtrace: OnceLock<Vec<String>>,
}

impl JobPayload {
    /// Decodes `raw`. Falls back to an empty map when it is not a JSON
    /// object; `queue` defaults to the payload's own `queue` field.
    pub fn new(raw: impl Into<String>, queue: impl Into<String>) -> Self {
        let raw = raw.into();
        let (item, parsed) = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(item)) => (item, true),
            _ => {
                tracing::debug!(len = raw.len(), "Job payload is not a JSON object");
                (Map::new(), false)
            }
        };
        let mut queue = queue.into();
        if queue.is_empty() {
            queue = item
                .get("queue")
                .and_then(coerce::to_string)
                .unwrap_or_default();
        }
        Self {
            raw,
            item,
            queue,
            parsed,
            position: None,
            display_class: OnceLock::new(),
            display_args: OnceLock::new(),
            backtrace: OnceLock::new(),
        }
    }

    pub(crate) fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn item(&self) -> &Map<String, Value> {
        &self.item
    }

    /// Whether the raw text decoded to a JSON object.
    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// 1-based row label assigned by queue listings.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn jid(&self) -> &str {
        self.str_field("jid")
    }

    pub fn class(&self) -> &str {
        self.str_field("class")
    }

    pub fn bid(&self) -> Option<&str> {
        self.opt_str_field("bid")
    }

    pub fn args(&self) -> Vec<Value> {
        if !self.parsed {
            return vec![Value::String(self.raw.clone())];
        }
        match self.item.get("args") {
            Some(Value::Array(args)) => args.clone(),
            _ => vec![],
        }
    }

    /// Current attributes captured at enqueue time (`cattr`).
    pub fn context(&self) -> Option<&Value> {
        self.item.get("cattr").filter(|value| !value.is_null())
    }

    pub fn tags(&self) -> Vec<String> {
        match self.item.get("tags") {
            Some(Value::Array(tags)) => tags.iter().filter_map(coerce::to_string).collect(),
            _ => vec![],
        }
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.time_field("enqueued_at")
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.time_field("created_at")
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.time_field("failed_at")
    }

    pub fn retried_at(&self) -> Option<DateTime<Utc>> {
        self.time_field("retried_at")
    }

    pub fn error_class(&self) -> Option<&str> {
        self.opt_str_field("error_class")
    }

    pub fn error_message(&self) -> Option<&str> {
        self.opt_str_field("error_message")
    }

    pub fn retry_count(&self) -> Option<i64> {
        self.item.get("retry_count").and_then(coerce::to_i64)
    }

    pub fn is_encrypted(&self) -> bool {
        self.item
            .get("encrypt")
            .is_some_and(|value| coerce::to_bool(value).unwrap_or(!value.is_null()))
    }

    pub fn is_wrapped(&self) -> bool {
        WRAPPER_CLASSES.contains(&self.class())
    }

    /// Error backtrace, decoding the compressed form when needed.
    pub fn error_backtrace(&self) -> &[String] {
        self.backtrace
            .get_or_init(|| decode_backtrace(self.item.get("error_backtrace")))
    }

    /// Class name to show for the job, unwrapping adapter wrappers and mailers.
    pub fn display_class(&self) -> &str {
        self.display_class.get_or_init(|| match self.kind() {
            JobKind::Plain => self.class().to_string(),
            JobKind::Wrapped { class } => class.unwrap_or_else(|| self.class().to_string()),
            JobKind::Mailer { .. } => {
                let arguments = self.wrapped_arguments();
                match (
                    arguments.first().and_then(Value::as_str),
                    arguments.get(1).and_then(Value::as_str),
                ) {
                    (Some(mailer), Some(method)) => format!("{mailer}#{method}"),
                    _ => self.unwrapped_class().unwrap_or_default(),
                }
            }
        })
    }

    /// Arguments to show for the job.
    pub fn display_args(&self) -> &[Value] {
        self.display_args.get_or_init(|| match self.kind() {
            JobKind::Plain => {
                let mut args = self.args();
                if self.is_encrypted()
                    && let Some(last) = args.last_mut()
                {
                    *last = Value::String(ENCRYPTED_ARG.to_string());
                }
                args
            }
            JobKind::Wrapped { .. } => self.deserialized_arguments(),
            JobKind::Mailer { kind } => {
                let rest: Vec<Value> = self.deserialized_arguments().into_iter().skip(3).collect();
                match kind {
                    MailerKind::Delivery => rest,
                    MailerKind::MailDelivery => match rest.first() {
                        Some(Value::Object(params)) => vec![
                            params.get("params").cloned().unwrap_or(Value::Null),
                            params.get("args").cloned().unwrap_or(Value::Null),
                        ],
                        _ => rest,
                    },
                }
            }
        })
    }

    /// Seconds since the job was enqueued (or created), never negative.
    pub fn latency(&self, now: DateTime<Utc>) -> f64 {
        self.enqueued_at()
            .or_else(|| self.created_at())
            .map_or(0.0, |at| {
                ((now - at).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0).max(0.0)
            })
    }

    fn kind(&self) -> JobKind {
        if !self.is_wrapped() {
            return JobKind::Plain;
        }
        let class = self.unwrapped_class();
        match class.as_deref().and_then(MailerKind::from_class) {
            Some(kind) => JobKind::Mailer { kind },
            None => JobKind::Wrapped { class },
        }
    }

    fn unwrapped_class(&self) -> Option<String> {
        self.opt_str_field("wrapped")
            .map(str::to_string)
            .or_else(|| {
                self.args()
                    .first()
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
    }

    /// The `arguments` array of the adapter's single map argument.
    fn wrapped_arguments(&self) -> Vec<Value> {
        match self.item.get("args") {
            Some(Value::Array(args)) => match args.first() {
                Some(Value::Object(job)) => match job.get("arguments") {
                    Some(Value::Array(arguments)) => arguments.clone(),
                    _ => vec![],
                },
                _ => vec![],
            },
            _ => vec![],
        }
    }

    fn deserialized_arguments(&self) -> Vec<Value> {
        self.wrapped_arguments()
            .into_iter()
            .map(deserialize_argument)
            .collect()
    }

    fn str_field(&self, field: &str) -> &str {
        self.opt_str_field(field).unwrap_or_default()
    }

    fn opt_str_field(&self, field: &str) -> Option<&str> {
        self.item
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    fn time_field(&self, field: &str) -> Option<DateTime<Utc>> {
        self.item.get(field).and_then(coerce::to_time)
    }
}

impl PartialEq for JobPayload {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.queue == other.queue && self.position == other.position
    }
}

impl Serialize for JobPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.parsed {
            self.item.serialize(serializer)
        } else {
            serializer.serialize_str(&self.raw)
        }
    }
}

/// Undoes the adapter's argument serialisation: global-id wrappers collapse
/// to their id and `_aj_` bookkeeping keys are dropped.
fn deserialize_argument(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(deserialize_argument).collect()),
        Value::Object(mut map) => {
            if map.len() == 1
                && let Some(global_id) = map.remove("_aj_globalid")
            {
                return global_id;
            }
            Value::Object(
                map.into_iter()
                    .filter(|(key, _)| !key.starts_with("_aj_"))
                    .map(|(key, value)| (key, deserialize_argument(value)))
                    .collect(),
            )
        }
        other => other,
    }
}

fn decode_backtrace(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(lines)) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(encoded)) => decode_compressed_backtrace(encoded).unwrap_or_default(),
        _ => vec![],
    }
}

/// base64 → zlib → JSON array of strings.
fn decode_compressed_backtrace(encoded: &str) -> Option<Vec<String>> {
    let compressed = BASE64.decode(encoded.trim()).ok()?;
    let mut json = String::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_string(&mut json)
        .ok()?;
    serde_json::from_str::<Vec<String>>(&json).ok()
}
