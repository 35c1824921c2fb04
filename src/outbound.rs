//! Outbound adapter: application messages to MQTT publishes
//!
//! One [`MqttProducer`] per producer binding, owning its connection. There
//! is no buffering or batching; `handle` awaits the client, so back-pressure
//! reaches the caller directly.

use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::mqttbytes::QoS;
use thiserror::Error;
use tracing::{debug, error};

use crate::codec::{self, CodecError};
use crate::config::EffectiveConnectionConfig;
use crate::connection::{Connection, ConnectionError};
use crate::message::{headers, HeaderValue, Message};

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::v5::ClientError),

    #[error("producer is stopped")]
    Stopped,
}

/// Publishes one application message per invocation, at least once.
pub struct MqttProducer {
    connection: Option<Connection>,
    topic: String,
}

impl MqttProducer {
    /// Resolves nothing further: the configuration is already effective.
    /// Connects eagerly; a failed handshake means the producer never exists.
    pub async fn initialize(
        config: &EffectiveConnectionConfig,
        destination: &str,
    ) -> Result<Self, ConnectionError> {
        let connection = Connection::initialize(config).await?;
        Ok(Self {
            connection: Some(connection),
            topic: destination.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_stopped(&self) -> bool {
        self.connection.is_none()
    }

    /// Publishes `message` to its resolved topic with QoS at-least-once.
    ///
    /// A payload that cannot be rendered is logged and skipped; the producer
    /// keeps running and the message is not retried.
    pub async fn handle(&self, message: &Message) -> Result<(), OutboundError> {
        let connection = self.connection.as_ref().ok_or(OutboundError::Stopped)?;
        let topic = resolve_topic(message, &self.topic);

        let Some(payload) = render_payload(&topic, codec::encode(message.payload())) else {
            return Ok(());
        };

        debug!(topic = %topic, bytes = payload.len(), "publishing message");
        connection
            .client()
            .publish_with_properties(
                topic,
                QoS::AtLeastOnce,
                false,
                payload,
                publish_properties(message),
            )
            .await?;
        Ok(())
    }

    /// Tears down the connection; the producer rejects further messages.
    pub async fn stop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }
}

/// A payload that fails to render is logged and dropped; the producer keeps
/// running and the message is not retried.
fn render_payload(topic: &str, encoded: Result<Vec<u8>, CodecError>) -> Option<Vec<u8>> {
    match encoded {
        Ok(payload) => Some(payload),
        Err(err) => {
            error!(topic = %topic, error = %err, "could not render payload, dropping message");
            None
        }
    }
}

/// Header `mqtt_topic` overrides the configured destination for one publish.
fn resolve_topic(message: &Message, configured: &str) -> String {
    message
        .header(headers::TOPIC)
        .and_then(HeaderValue::as_text)
        .filter(|topic| !topic.is_empty())
        .unwrap_or(configured)
        .to_string()
}

/// Content type is the only header propagated as a publish property, and
/// only when the header value is a string.
fn publish_properties(message: &Message) -> PublishProperties {
    let content_type = message
        .header(headers::CONTENT_TYPE)
        .and_then(HeaderValue::as_text)
        .map(str::to_string);

    PublishProperties {
        content_type,
        ..Default::default()
    }
}
