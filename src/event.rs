//! Inbound event model.
//!
//! Events are open-schema JSON objects. Only `event_type` is required;
//! every other field passes through untouched to predicates and templates.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Field carrying the event type.
pub const EVENT_TYPE_FIELD: &str = "event_type";
/// Field carrying the producer timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";
/// Field carrying the optional producer identity.
pub const SOURCE_FIELD: &str = "source";
/// Field injected into outbound payloads before they reach an agent.
pub const USERNAME_FIELD: &str = "username";

/// Errors raised while parsing an event body.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Event body must be a JSON object")]
    NotAnObject,

    #[error("event_type missing in event data")]
    MissingEventType,
}

/// A parsed, immutable event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    /// Producer timestamp, or the time of parsing when the producer omitted it.
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    /// The full body, including the well-known fields above.
    pub payload: Map<String, Value>,
}

impl Event {
    /// Parse an event from a raw message body.
    pub fn parse(body: &[u8]) -> Result<Self, EventError> {
        let value: Value = serde_json::from_slice(body)?;
        let Value::Object(payload) = value else {
            return Err(EventError::NotAnObject);
        };
        Self::from_payload(payload)
    }

    /// Build an event from an already decoded JSON object.
    pub fn from_payload(payload: Map<String, Value>) -> Result<Self, EventError> {
        let event_type = payload
            .get(EVENT_TYPE_FIELD)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(EventError::MissingEventType)?
            .to_string();

        let timestamp = payload
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let source = payload
            .get(SOURCE_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            event_type,
            timestamp,
            source,
            payload,
        })
    }

    /// Look up a payload field as a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Accepts RFC 3339 and naive ISO-8601 timestamps (treated as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Insert `username` into a JSON object body, returning the re-encoded body.
///
/// Used on the outbound leg so that the agent knows whose template to run.
pub fn inject_username(body: &str, username: &str) -> Result<String, EventError> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Object(mut payload) = value else {
        return Err(EventError::NotAnObject);
    };
    payload.insert(
        USERNAME_FIELD.to_string(),
        Value::String(username.to_string()),
    );
    Ok(serde_json::to_string(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    #[test]
    fn test_parse_minimal_event() {
        let event = Event::parse(br#"{"event_type":"t2","strategy":"s1"}"#).unwrap();
        assert_eq!(event.event_type, "t2");
        assert_eq!(event.field_str("strategy"), Some("s1"));
        assert!(event.source.is_none());
    }

    #[test]
    fn test_parse_missing_event_type() {
        let err = Event::parse(br#"{"strategy":"s1"}"#).unwrap_err();
        assert!(matches!(err, EventError::MissingEventType));
    }

    #[test]
    fn test_parse_empty_event_type() {
        let err = Event::parse(br#"{"event_type":""}"#).unwrap_err();
        assert!(matches!(err, EventError::MissingEventType));
    }

    #[test]
    fn test_parse_non_object() {
        assert!(matches!(
            Event::parse(b"[1,2]").unwrap_err(),
            EventError::NotAnObject
        ));
        assert!(matches!(
            Event::parse(b"not json").unwrap_err(),
            EventError::InvalidJson(_)
        ));
    }

    #[test]
    fn test_parse_timestamp_and_source() {
        let event = Event::parse(
            br#"{"event_type":"a","timestamp":"2024-01-01T10:00:00Z","source":"gen"}"#,
        )
        .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(event.source.as_deref(), Some("gen"));
    }

    #[test]
    fn test_parse_naive_timestamp() {
        let event =
            Event::parse(br#"{"event_type":"a","timestamp":"2024-03-05T01:02:03.123456"}"#)
                .unwrap();
        assert_eq!(event.timestamp.month(), 3);
        assert_eq!(event.timestamp.day(), 5);
    }

    #[test]
    fn test_missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let event = Event::parse(br#"{"event_type":"a"}"#).unwrap();
        assert!(event.timestamp >= before);
    }

    #[test]
    fn test_inject_username() {
        let body = inject_username(r#"{"event_type":"t2","x":1}"#, "alice").unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["x"], 1);
    }

    #[test]
    fn test_inject_username_overwrites_producer_value() {
        let body = inject_username(r#"{"event_type":"t2","username":"mallory"}"#, "bob").unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["username"], "bob");
    }
}
