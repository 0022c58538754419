use serde_json::{Map, Number, Value};

use crate::KiqlensError;

/// Strictly decodes a job payload for the mutation paths.
///
/// Trailing non-whitespace input is rejected and numeric tokens keep their
/// original text, so serialising the result again leaves `enqueued_at`,
/// `created_at` and `retry_count` byte-identical unless they are rewritten.
pub(crate) fn safe_parse_json(raw: &str) -> Result<Map<String, Value>, KiqlensError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(item) => Ok(item),
        other => Err(KiqlensError::Malformed(format!(
            "expected a JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

/// Subtracts one from a JSON number without changing how it is written:
/// integers stay integers and decimals keep their fraction width.
pub(crate) fn decrement_number(value: &Value) -> Option<Value> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };

    let decremented = if let Ok(i) = text.parse::<i64>() {
        i.checked_sub(1)?.to_string()
    } else {
        let f = text.parse::<f64>().ok().filter(|f| f.is_finite())?;
        let precision = text
            .split_once('.')
            .map_or(0, |(_, fraction)| fraction.len());
        format!("{:.*}", precision, f - 1.0)
    };

    match value {
        Value::String(_) => Some(Value::String(decremented)),
        _ => serde_json::from_str::<Number>(&decremented)
            .ok()
            .map(Value::Number),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
