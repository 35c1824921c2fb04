//! Inbound adapter: MQTT publications to application messages
//!
//! Lifecycle as a statum state machine, driven by the [`MqttConsumer`]
//! facade:
//!
//! ```text
//! Stopped ──subscribe──► Starting ──run──► Running ──shutdown──► Stopping ──finish──► Stopped
//! ```
//!
//! The running engine is a single worker task that takes one available
//! publication at a time, projects it into a [`Message`] with the MQTT
//! metadata copied into headers, and delivers it downstream. One malformed
//! publication never terminates the loop. Stopping is cooperative and
//! observed between records: the record in flight finishes delivery, the
//! rest of the backlog stays undelivered.

use std::collections::HashMap;
use std::time::Duration;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::AsyncClient;
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::codec::{self, CodecError};
use crate::config::EffectiveConnectionConfig;
use crate::connection::{Connection, ConnectionError, PublicationRecord};
use crate::message::{headers, HeaderValue, Message};

/// Idle yield between empty polls, well under a millisecond.
const IDLE_POLL_DELAY: Duration = Duration::from_micros(500);

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::v5::ClientError),

    #[error("publication topic is not valid UTF-8")]
    MalformedTopic,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("downstream pipeline is closed")]
    DownstreamClosed,

    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer is stopped")]
    Stopped,
}

/// Receive-loop lifecycle states.
#[state]
#[derive(Debug, Clone)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Receive loop with compile-time lifecycle safety.
#[machine]
pub struct ConsumerEngine<S: ConsumerState> {
    topic: String,
    publications: mpsc::Receiver<PublicationRecord>,
    downstream: mpsc::Sender<Message>,
}

impl ConsumerEngine<Stopped> {
    pub fn create(
        topic: String,
        publications: mpsc::Receiver<PublicationRecord>,
        downstream: mpsc::Sender<Message>,
    ) -> Self {
        Self::new(topic, publications, downstream)
    }

    /// Enqueues the topic subscription at QoS at-least-once.
    ///
    /// The client only queues the SUBSCRIBE packet; the broker's
    /// acknowledgment surfaces on the connection's event loop, not here.
    /// Publications arriving once the subscription is active are buffered
    /// by the connection driver, so none are lost in the interim. On
    /// failure the engine is handed back so its receiver can be restored.
    pub async fn subscribe(
        self,
        client: &AsyncClient,
    ) -> Result<ConsumerEngine<Starting>, (Self, InboundError)> {
        match client.subscribe(self.topic.clone(), QoS::AtLeastOnce).await {
            Ok(_) => {
                info!(topic = %self.topic, "subscribed");
                Ok(self.transition())
            }
            Err(err) => Err((self, err.into())),
        }
    }

    /// Dissolves the engine, handing back the publication receiver.
    pub fn into_receiver(mut self) -> mpsc::Receiver<PublicationRecord> {
        let (_tx, detached) = mpsc::channel(1);
        std::mem::replace(&mut self.publications, detached)
    }
}

impl ConsumerEngine<Starting> {
    pub fn run(self) -> ConsumerEngine<Running> {
        self.transition()
    }
}

impl ConsumerEngine<Running> {
    /// Receive loop; runs until the shutdown signal is observed.
    ///
    /// Per-record failures (malformed topic or payload, downstream
    /// rejection) are logged and the loop continues.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> ConsumerEngine<Stopping> {
        loop {
            // The stop signal is checked between records, so at most the
            // record in flight completes after it fires. A dropped sender
            // counts as a stop; the worker must not outlive its handle.
            match shutdown_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => break,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            match self.publications.try_recv() {
                Ok(record) => {
                    if let Err(err) = self.dispatch(record).await {
                        error!(topic = %self.topic, error = %err, "failed to process publication");
                    }
                }
                Err(_) => tokio::time::sleep(IDLE_POLL_DELAY).await,
            }
        }

        info!(topic = %self.topic, "receive loop stopped");
        self.transition()
    }

    async fn dispatch(&self, record: PublicationRecord) -> Result<(), InboundError> {
        let message = project(record)?;
        debug!(topic = %self.topic, "delivering message downstream");
        self.downstream
            .send(message)
            .await
            .map_err(|_| InboundError::DownstreamClosed)
    }
}

impl ConsumerEngine<Stopping> {
    /// Drops the publication receiver; no unsubscribe is sent to the broker.
    pub fn finish(self) -> ConsumerEngine<Stopped> {
        self.transition()
    }
}

/// Projects one broker record into an application message.
///
/// QoS code, retain flag and topic are always present in the headers;
/// response topic, content type and correlation data only when the
/// publication carries them. The payload is wrapped as UTF-8 text.
fn project(record: PublicationRecord) -> Result<Message, InboundError> {
    let topic = std::str::from_utf8(&record.topic)
        .map_err(|_| InboundError::MalformedTopic)?
        .to_string();
    let payload = codec::decode(&record.payload)?;

    let mut header_map = HashMap::new();
    header_map.insert(
        headers::RECEIVED_QOS.to_string(),
        HeaderValue::Integer(record.qos as i64),
    );
    header_map.insert(
        headers::RECEIVED_RETAINED.to_string(),
        HeaderValue::Boolean(record.retain),
    );
    header_map.insert(headers::RECEIVED_TOPIC.to_string(), HeaderValue::Text(topic));

    if let Some(response_topic) = record.response_topic {
        header_map.insert(
            headers::RESPONSE_TOPIC.to_string(),
            HeaderValue::Text(response_topic),
        );
    }
    if let Some(content_type) = record.content_type {
        header_map.insert(
            headers::CONTENT_TYPE.to_string(),
            HeaderValue::Text(content_type),
        );
    }
    if let Some(correlation_data) = record.correlation_data {
        header_map.insert(
            headers::CORRELATION_DATA.to_string(),
            HeaderValue::Binary(correlation_data.to_vec()),
        );
    }

    Ok(Message::new(payload, header_map))
}

struct ConsumerWorker {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Message-driven consumer endpoint for one destination.
///
/// Owns its connection and at most one worker task. `start` after `stop`
/// is not supported; a stopped consumer is reinitialized instead.
pub struct MqttConsumer {
    connection: Option<Connection>,
    topic: String,
    downstream: mpsc::Sender<Message>,
    worker: Option<ConsumerWorker>,
}

impl MqttConsumer {
    /// Connects eagerly; a failed handshake means the consumer never exists.
    pub async fn initialize(
        config: &EffectiveConnectionConfig,
        destination: &str,
        downstream: mpsc::Sender<Message>,
    ) -> Result<Self, ConnectionError> {
        let connection = Connection::initialize(config).await?;
        Ok(Self {
            connection: Some(connection),
            topic: destination.to_string(),
            downstream,
            worker: None,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Subscribes and spawns the single worker task.
    pub async fn start(&mut self) -> Result<(), InboundError> {
        if self.worker.is_some() {
            return Err(InboundError::AlreadyRunning);
        }
        let connection = self.connection.as_mut().ok_or(InboundError::Stopped)?;
        let publications = connection
            .take_publications()
            .ok_or(InboundError::AlreadyRunning)?;

        let engine = ConsumerEngine::create(
            self.topic.clone(),
            publications,
            self.downstream.clone(),
        );
        let engine = match engine.subscribe(connection.client()).await {
            Ok(engine) => engine,
            Err((engine, err)) => {
                // Hand the receiver back so a retried start can succeed.
                connection.restore_publications(engine.into_receiver());
                return Err(err);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            engine.run().run_until_shutdown(shutdown_rx).await.finish();
        });
        self.worker = Some(ConsumerWorker { shutdown_tx, task });
        Ok(())
    }

    /// Signals the worker, waits for it to finish the record in flight,
    /// then tears down the connection.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown_tx.send(());
            let _ = worker.task.await;
        }
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }
}
