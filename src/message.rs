//! Generic message representation exchanged with the binding framework
//!
//! A [`Message`] is the unit the adapters consume and produce: an opaque
//! payload plus a flat header map. Adapters never mutate a message in
//! place; every conversion builds a new one.

use std::collections::HashMap;

use serde_json::Value;

use crate::codec::CodecError;

/// Header names mapped to and from MQTT v5 publish fields.
///
/// The names follow the conventions of the upstream binding framework, so
/// applications can route on them without knowing about this crate.
pub mod headers {
    /// Outbound only: overrides the configured destination for one publish.
    pub const TOPIC: &str = "mqtt_topic";
    /// Content type, propagated in both directions.
    pub const CONTENT_TYPE: &str = "contentType";
    /// Inbound: QoS code the publication was received with.
    pub const RECEIVED_QOS: &str = "mqtt_receivedQos";
    /// Inbound: retain flag of the received publication.
    pub const RECEIVED_RETAINED: &str = "mqtt_receivedRetained";
    /// Inbound: topic the publication arrived on.
    pub const RECEIVED_TOPIC: &str = "mqtt_receivedTopic";
    /// Inbound: MQTT v5 response topic, when the publisher set one.
    pub const RESPONSE_TOPIC: &str = "mqtt_responseTopic";
    /// Inbound: MQTT v5 correlation data, raw bytes, when present.
    pub const CORRELATION_DATA: &str = "mqtt_correlationData";
}

/// Payload of a [`Message`].
///
/// `Binary` and `Text` pass through the codec untouched; `Value` carries an
/// arbitrary structured payload that gets rendered to JSON text on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
    Value(Value),
}

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Binary(Vec<u8>),
}

impl HeaderValue {
    /// Returns the string content, or `None` for non-text values.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            HeaderValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            HeaderValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

/// Application message: payload plus headers, insertion order irrelevant.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Payload,
    headers: HashMap<String, HeaderValue>,
}

impl Message {
    pub fn new(payload: Payload, headers: HashMap<String, HeaderValue>) -> Self {
        Self { payload, headers }
    }

    /// Message with a binary payload and no headers.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Payload::Binary(payload.into()), HashMap::new())
    }

    /// Message with a text payload and no headers.
    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(Payload::Text(payload.into()), HashMap::new())
    }

    /// Message with a structured payload, serialized through `serde_json`.
    ///
    /// Fails when the value cannot be represented as JSON, e.g. a map with
    /// non-string keys.
    pub fn json<T: serde::Serialize>(payload: T) -> Result<Self, CodecError> {
        let value = serde_json::to_value(payload)?;
        Ok(Self::new(Payload::Value(value), HashMap::new()))
    }

    /// Returns a copy of this message with the given header set.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &HashMap<String, HeaderValue> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_header_builds_new_message() {
        let message = Message::text("hello").with_header(headers::TOPIC, "override");

        assert_eq!(message.payload(), &Payload::Text("hello".to_string()));
        assert_eq!(
            message.header(headers::TOPIC).and_then(HeaderValue::as_text),
            Some("override")
        );
    }

    #[test]
    fn json_payload_wraps_value() {
        let message = Message::json(json!({"a": 1})).unwrap();
        assert_eq!(message.payload(), &Payload::Value(json!({"a": 1})));
    }

    #[test]
    fn header_value_accessors_reject_other_kinds() {
        assert_eq!(HeaderValue::Integer(1).as_text(), None);
        assert_eq!(HeaderValue::Text("x".into()).as_integer(), None);
        assert_eq!(HeaderValue::Boolean(true).as_boolean(), Some(true));
        assert_eq!(
            HeaderValue::Binary(vec![1, 2]).as_binary(),
            Some([1u8, 2].as_slice())
        );
    }
}
