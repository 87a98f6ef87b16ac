//! Decoding of raw bus payloads into [`TypedRecord`]s.
//!
//! Payloads are JSON objects. Each field declared by the [`StreamDefinition`] is converted to its
//! declared type, undeclared keys are ignored. Timestamps are kept at microsecond precision, the
//! precision of the persisted columns, so a record re-encoded with [`encode`] decodes to itself.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Number};

use crate::message::{RawMessage, TypedRecord, Value};
use crate::schema::{FieldSpec, FieldType, StreamDefinition};

/// A payload that does not conform to its stream definition.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Decoding {stream} at offset {offset} - {reason}")]
pub struct DecodeError {
    pub stream: String,
    pub offset: i64,
    pub reason: String,
}

pub fn decode(raw: &RawMessage, schema: &StreamDefinition) -> Result<TypedRecord, DecodeError> {
    let fail = |reason: String| DecodeError {
        stream: schema.name.to_string(),
        offset: raw.offset,
        reason,
    };

    let payload: serde_json::Value =
        serde_json::from_slice(&raw.payload).map_err(|e| fail(format!("invalid JSON: {e}")))?;
    let serde_json::Value::Object(object) = payload else {
        return Err(fail(format!("expected a JSON object, got {}", kind(&payload))));
    };

    let mut fields = BTreeMap::new();
    for spec in schema.fields {
        let value = match object.get(spec.name) {
            None | Some(serde_json::Value::Null) if spec.nullable => Value::Null,
            None | Some(serde_json::Value::Null) => {
                return Err(fail(format!("missing required field '{}'", spec.name)));
            }
            Some(value) => convert(spec, value).map_err(fail)?,
        };
        fields.insert(spec.name.to_string(), value);
    }

    let event_time = match fields.get(schema.event_time_field) {
        Some(Value::Timestamp(ts)) => *ts,
        _ => {
            return Err(fail(format!(
                "event time field '{}' is not a timestamp",
                schema.event_time_field
            )));
        }
    };

    Ok(TypedRecord {
        stream: schema.name,
        offset: raw.offset,
        fields,
        event_time,
    })
}

fn convert(spec: &FieldSpec, value: &serde_json::Value) -> Result<Value, String> {
    let mismatch = |expected: &str| {
        format!(
            "field '{}' expected {expected}, got {}",
            spec.name,
            kind(value)
        )
    };

    match spec.field_type {
        FieldType::String => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| mismatch("a string")),
        FieldType::Double => value
            .as_f64()
            .map(Value::Double)
            .ok_or_else(|| mismatch("a number")),
        FieldType::Integer => {
            let n = value.as_i64().ok_or_else(|| mismatch("an integer"))?;
            i32::try_from(n)
                .map(Value::Integer)
                .map_err(|_| format!("field '{}' value {n} is out of integer range", spec.name))
        }
        FieldType::Timestamp => {
            let s = value.as_str().ok_or_else(|| mismatch("a timestamp string"))?;
            parse_timestamp(s)
                .map(Value::Timestamp)
                .ok_or_else(|| format!("field '{}' has unrecognized timestamp '{s}'", spec.name))
        }
    }
}

/// Parses `YYYY-MM-DDTHH:MM:SS[.fraction][offset]`, with a space accepted in place of the `T`.
/// A timestamp without offset is taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    // the date part is fixed width, anything shorter than a full date-time is rejected here
    if s.len() < 19 || !s.is_char_boundary(10) {
        return None;
    }
    let normalized = match s.as_bytes().get(10) {
        Some(b'T') => s.to_string(),
        Some(b' ') => format!("{}T{}", s.get(..10)?, s.get(11..)?),
        _ => return None,
    };

    let parsed = match DateTime::parse_from_rfc3339(&normalized) {
        Ok(with_offset) => with_offset.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()?
            .and_utc(),
    };
    Some(parsed.trunc_subsecs(6))
}

/// Renders a record back into a JSON object of its stream schema.
pub fn encode(record: &TypedRecord) -> serde_json::Value {
    let object: Map<String, serde_json::Value> = record
        .fields
        .iter()
        .map(|(name, value)| (name.clone(), encode_value(value)))
        .collect();
    serde_json::Value::Object(object)
}

fn encode_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Double(d) => Number::from_f64(*d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Integer(i) => serde_json::Value::Number((*i).into()),
        Value::Timestamp(ts) => {
            serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
        }
    }
}

fn kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
