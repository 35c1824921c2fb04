//! Connection management for one adapter instance
//!
//! Every adapter owns exactly one [`Connection`]: an MQTT v5 client plus a
//! driver task that keeps the rumqttc event loop turning. The initial
//! handshake is awaited synchronously during [`Connection::initialize`] and
//! is fatal on failure; link loss after that point is retried transparently
//! by re-polling the event loop with exponential backoff (500 ms initial,
//! 2 min cap).
//!
//! Subscribed publications observed by the driver are forwarded, in arrival
//! order, into an mpsc channel the inbound adapter drains. Producer-side
//! connections never subscribe, so their channel stays empty.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EffectiveConnectionConfig};

/// First delay after a lost link.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Cap for the exponentially growing reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Capacity of the client request queue and the publication channel.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Configuration problems surfaced while building the client, e.g. an
    /// unreadable trust store.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The initial handshake failed at the transport level.
    #[error("broker handshake failed: {0}")]
    Handshake(#[from] rumqttc::v5::ConnectionError),

    /// The broker answered the handshake with a non-success code.
    #[error("broker refused connection: {code}")]
    HandshakeRefused { code: String },

    /// The handshake did not complete within the configured timeout.
    #[error("broker handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// The broker-delivered unit, detached from the client's event types.
///
/// Lives only until the inbound adapter projects it into a message.
#[derive(Debug, Clone)]
pub struct PublicationRecord {
    pub topic: Bytes,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
}

impl From<Publish> for PublicationRecord {
    fn from(publish: Publish) -> Self {
        let (content_type, response_topic, correlation_data) = match publish.properties {
            Some(properties) => (
                properties.content_type,
                properties.response_topic,
                properties.correlation_data,
            ),
            None => (None, None, None),
        };

        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            content_type,
            response_topic,
            correlation_data,
        }
    }
}

/// One client connection, exclusively owned by a single adapter.
pub struct Connection {
    client: AsyncClient,
    publications: Option<mpsc::Receiver<PublicationRecord>>,
    driver: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Connection {
    /// Builds the client from the resolved configuration and performs the
    /// initial blocking connect.
    ///
    /// Returns only after the broker accepted the handshake; any handshake
    /// failure, refusal, or timeout is fatal to adapter startup.
    pub async fn initialize(config: &EffectiveConnectionConfig) -> Result<Self, ConnectionError> {
        let options = build_options(config)?;
        let (client, mut event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        match tokio::time::timeout(config.connection_timeout, await_handshake(&mut event_loop))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::HandshakeTimeout(config.connection_timeout)),
        }
        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "broker connection established"
        );

        let (publication_tx, publication_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(event_loop, publication_tx, cancel.clone()));

        Ok(Self {
            client,
            publications: Some(publication_rx),
            driver,
            cancel,
        })
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Hands out the subscribed-publication channel; `None` once taken.
    pub fn take_publications(&mut self) -> Option<mpsc::Receiver<PublicationRecord>> {
        self.publications.take()
    }

    /// Puts the publication channel back after a start that failed before
    /// spawning a worker, so a retried start finds it again.
    pub fn restore_publications(&mut self, publications: mpsc::Receiver<PublicationRecord>) {
        self.publications = Some(publications);
    }

    /// Sends a best-effort disconnect and stops the driver task.
    pub async fn shutdown(self) {
        let _ = self.client.disconnect().await;
        self.cancel.cancel();
        let _ = self.driver.await;
    }
}

fn build_options(config: &EffectiveConnectionConfig) -> Result<MqttOptions, ConnectionError> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(KEEP_ALIVE);

    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }

    if let Some(trust_store) = &config.trust_store {
        let ca = trust_store.load().map_err(ConnectionError::Config)?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(options)
}

/// Polls the event loop until the broker answers the CONNECT packet.
async fn await_handshake(event_loop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(ConnectionError::HandshakeRefused {
                    code: format!("{:?}", ack.code),
                });
            }
            // Outgoing CONNECT and other bookkeeping events precede the ack.
            Ok(_) => continue,
            Err(err) => return Err(ConnectionError::Handshake(err)),
        }
    }
}

/// Keeps the event loop polled for the lifetime of the connection.
///
/// rumqttc reconnects by itself when `poll` is called again after an error;
/// the backoff sleep between error and re-poll is what turns that into the
/// 500 ms - 2 min policy.
async fn drive(
    mut event_loop: EventLoop,
    publications: mpsc::Sender<PublicationRecord>,
    cancel: CancellationToken,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    delay = INITIAL_RECONNECT_DELAY;
                    if publications
                        .send(PublicationRecord::from(publish))
                        .await
                        .is_err()
                    {
                        // Subscriber is gone; the link stays up until the
                        // connection itself is shut down.
                        debug!("discarding publication without an active subscriber");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    delay = INITIAL_RECONNECT_DELAY;
                    info!("broker link re-established");
                }
                Ok(_) => {
                    delay = INITIAL_RECONNECT_DELAY;
                }
                Err(err) => {
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "broker link lost");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    debug!("connection driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustStoreProperties;
    use rumqttc::v5::mqttbytes::v5::PublishProperties;

    fn config() -> EffectiveConnectionConfig {
        EffectiveConnectionConfig {
            host: "localhost".to_string(),
            port: 1883,
            username: "guest".to_string(),
            password: "guest".to_string(),
            client_id: "test.client".to_string(),
            connection_timeout: Duration::from_secs(5),
            trust_store: None,
        }
    }

    #[test]
    fn options_build_without_trust_store() {
        assert!(build_options(&config()).is_ok());
    }

    #[test]
    fn unreadable_trust_store_is_fatal() {
        let mut config = config();
        config.trust_store = Some(TrustStoreProperties::new("/nonexistent/ca.pem"));

        assert!(matches!(
            build_options(&config),
            Err(ConnectionError::Config(
                ConfigError::UnreadableTrustStore { .. }
            ))
        ));
    }

    #[test]
    fn record_carries_optional_properties() {
        let mut publish = Publish::new(
            "sensors/temp",
            QoS::AtLeastOnce,
            Bytes::from_static(b"21.5"),
            Some(PublishProperties {
                content_type: Some("text/plain".to_string()),
                response_topic: Some("replies".to_string()),
                correlation_data: Some(Bytes::from_static(b"req-1")),
                ..Default::default()
            }),
        );
        publish.retain = true;

        let record = PublicationRecord::from(publish);
        assert_eq!(record.topic, Bytes::from_static(b"sensors/temp"));
        assert_eq!(record.qos, QoS::AtLeastOnce);
        assert!(record.retain);
        assert_eq!(record.content_type.as_deref(), Some("text/plain"));
        assert_eq!(record.response_topic.as_deref(), Some("replies"));
        assert_eq!(record.correlation_data, Some(Bytes::from_static(b"req-1")));
    }

    #[test]
    fn record_without_properties_has_no_optionals() {
        let publish = Publish::new("t", QoS::AtMostOnce, Bytes::new(), None);

        let record = PublicationRecord::from(publish);
        assert!(record.content_type.is_none());
        assert!(record.response_topic.is_none());
        assert!(record.correlation_data.is_none());
    }
}
