//! Versioned JSON envelope framing.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Protocol version spoken by this build. A mismatch is fatal for the
/// message, never for the connection.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors surfaced by envelope encode/decode.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("envelope missing message type")]
    MissingType,

    #[error("envelope missing timestamp")]
    MissingTimestamp,

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The framing for every wire message. Immutable once sent.
///
/// `payload` is kept as raw JSON so downstream parsers see the exact bytes
/// the peer produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Defaulted on decode so an absent field surfaces as
    /// `UnsupportedVersion(0)` rather than a generic parse error.
    #[serde(default)]
    pub version: u32,

    #[serde(rename = "type", default)]
    pub kind: String,

    /// Correlation id; mirrors `command_id` on the command path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Unix seconds. Zero is invalid.
    #[serde(default)]
    pub timestamp: i64,

    pub payload: Box<RawValue>,
}

impl Envelope {
    /// Build an envelope for `kind` around a serializable payload, stamped
    /// with the current time.
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, EnvelopeError> {
        let payload = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind: kind.to_string(),
            request_id: None,
            timestamp: crate::unix_now(),
            payload,
        })
    }

    /// Attach a correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Serialize to one wire frame. Invalid headers here are programmer
    /// errors, but they are reported rather than panicking so a bad message
    /// can never take down a connection.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one wire frame and validate the header.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Decode the payload against a typed schema.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_str(self.payload.get())?)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.version));
        }
        if self.kind.is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        if self.timestamp == 0 {
            return Err(EnvelopeError::MissingTimestamp);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let envelope = Envelope::new("event", &json!({"seq": 7, "id": "n1-000007"}))
            .unwrap()
            .with_request_id("req-1");

        let text = envelope.encode().unwrap();
        let parsed = Envelope::decode(&text).unwrap();

        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.kind, "event");
        assert_eq!(parsed.request_id.as_deref(), Some("req-1"));
        assert_eq!(parsed.timestamp, envelope.timestamp);
        assert_eq!(parsed.payload.get(), envelope.payload.get());
    }

    #[test]
    fn test_payload_preserved_verbatim() {
        // Key order and formatting must survive the trip untouched.
        let text = r#"{"version":1,"type":"event","timestamp":5,"payload":{"b":1,"a":2}}"#;
        let envelope = Envelope::decode(text).unwrap();
        assert_eq!(envelope.payload.get(), r#"{"b":1,"a":2}"#);
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let text = r#"{"version":2,"type":"event","timestamp":5,"payload":{}}"#;
        match Envelope::decode(text) {
            Err(EnvelopeError::UnsupportedVersion(2)) => {}
            other => panic!("expected version error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_type() {
        let text = r#"{"version":1,"type":"","timestamp":5,"payload":{}}"#;
        match Envelope::decode(text) {
            Err(EnvelopeError::MissingType) => {}
            other => panic!("expected missing type error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_timestamp() {
        let text = r#"{"version":1,"type":"event","timestamp":0,"payload":{}}"#;
        match Envelope::decode(text) {
            Err(EnvelopeError::MissingTimestamp) => {}
            other => panic!("expected missing timestamp error, got {:?}", other),
        }
    }

    #[test]
    fn test_absent_fields_map_to_specific_kinds() {
        let text = r#"{"type":"event","timestamp":5,"payload":{}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(EnvelopeError::UnsupportedVersion(0))
        ));

        let text = r#"{"version":1,"timestamp":5,"payload":{}}"#;
        assert!(matches!(Envelope::decode(text), Err(EnvelopeError::MissingType)));

        let text = r#"{"version":1,"type":"event","payload":{}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(EnvelopeError::MissingTimestamp)
        ));
    }

    #[test]
    fn test_rejects_malformed_json() {
        match Envelope::decode("{not json") {
            Err(EnvelopeError::Malformed(_)) => {}
            other => panic!("expected malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_validates_header() {
        let mut envelope = Envelope::new("event", &json!({})).unwrap();
        envelope.timestamp = 0;
        assert!(matches!(
            envelope.encode(),
            Err(EnvelopeError::MissingTimestamp)
        ));

        let mut envelope = Envelope::new("event", &json!({})).unwrap();
        envelope.kind.clear();
        assert!(matches!(envelope.encode(), Err(EnvelopeError::MissingType)));
    }
}
