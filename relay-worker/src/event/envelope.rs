//! Canonical JSON encoding of the delivery envelope.

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Map, Value};

use super::types::{Event, EventType};

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    event_type: EventType,
    timestamp: String,
    data: Value,
}

/// Serialize `{id, type, timestamp, data}` with a fixed key order, a
/// millisecond UTC timestamp and recursively sorted `data` keys.
///
/// The same event always yields the same bytes.
pub fn canonical_envelope(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    let envelope = Envelope {
        id: &event.id,
        event_type: event.event_type,
        timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        data: canonicalize(&event.payload),
    };
    serde_json::to_vec(&envelope)
}

/// Rebuild a JSON value with object keys in sorted order at every depth.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
