use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message as read from the bus, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub offset: i64,
    pub payload: Bytes,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Double(f64),
    Integer(i32),
    Timestamp(DateTime<Utc>),
}

/// A message decoded against its stream definition. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub stream: &'static str,
    pub offset: i64,
    /// Every field of the stream definition, `Null` when absent.
    pub fields: BTreeMap<String, Value>,
    pub event_time: DateTime<Utc>,
}

impl TypedRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Inclusive range of bus offsets covered by a polled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    pub first: i64,
    pub last: i64,
}

impl OffsetRange {
    pub fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }

    /// The range spanned by a batch of raw messages, None for an empty batch.
    pub fn of(messages: &[RawMessage]) -> Option<Self> {
        let first = messages.first()?.offset;
        let last = messages.last()?.offset;
        Some(Self { first, last })
    }

    /// First offset after the range.
    pub fn next(&self) -> i64 {
        self.last + 1
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(offset: i64) -> RawMessage {
        RawMessage {
            topic: "weather_data".to_string(),
            offset,
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn range_of_batch() {
        let batch: Vec<_> = (100..110).map(raw).collect();
        let range = OffsetRange::of(&batch).unwrap();
        assert_eq!(range, OffsetRange::new(100, 109));
        assert_eq!(range.next(), 110);
        assert_eq!(range.to_string(), "100..=109");
        assert!(OffsetRange::of(&[]).is_none());
    }
}
