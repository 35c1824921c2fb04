//! Binder facade: provisioning, adapter creation and lifecycle
//!
//! [`MqttBinder`] ties the property layers together. For each binding it
//! provisions the destination, resolves the effective connection
//! configuration through the [`BindingPropertiesChain`], and creates the
//! producer or consumer adapter with its own connection. Adapters are
//! driven afterwards through the [`Lifecycle`] trait.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::CodecError;
use crate::config::{
    BindingPropertiesChain, ConfigError, EffectiveConnectionConfig, MqttBinderProperties,
    MqttExtendedBindingProperties,
};
use crate::connection::ConnectionError;
use crate::inbound::{InboundError, MqttConsumer};
use crate::message::Message;
use crate::outbound::{MqttProducer, OutboundError};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("destination name is empty")]
    EmptyDestination,

    #[error("partitioning is not supported for mqtt destinations")]
    PartitioningUnsupported,
}

/// Aggregate error for binder-level operations.
#[derive(Debug, Error)]
pub enum BinderError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Inbound(#[from] InboundError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A provisioned destination: the MQTT topic an adapter binds to.
///
/// Provisioning is purely local; no broker interaction happens here. The
/// topic only materializes on the broker when something publishes or
/// subscribes to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDestination {
    name: String,
}

impl TopicDestination {
    /// Normalizes the requested name by trimming surrounding whitespace.
    pub fn provision(name: &str) -> Result<Self, ProvisioningError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProvisioningError::EmptyDestination);
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// MQTT topics have no partitions.
    pub fn name_for_partition(&self, _partition: u32) -> Result<String, ProvisioningError> {
        Err(ProvisioningError::PartitioningUnsupported)
    }
}

/// Destination provisioning for both binding directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttProvisioner;

impl MqttProvisioner {
    pub fn provision_producer_destination(
        &self,
        name: &str,
    ) -> Result<TopicDestination, ProvisioningError> {
        TopicDestination::provision(name)
    }

    /// Consumer groups carry no meaning for MQTT topics and are ignored.
    pub fn provision_consumer_destination(
        &self,
        name: &str,
        group: Option<&str>,
    ) -> Result<TopicDestination, ProvisioningError> {
        if let Some(group) = group {
            debug!(group, "consumer group is ignored for mqtt bindings");
        }
        TopicDestination::provision(name)
    }
}

/// Adapter lifecycle phases as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running,
}

/// Uniform start/stop surface over both adapter kinds.
#[async_trait]
pub trait Lifecycle {
    async fn start(&mut self) -> Result<(), BinderError>;

    /// Stopping is idempotent and never fails.
    async fn stop(&mut self);

    fn state(&self) -> LifecycleState;
}

#[async_trait]
impl Lifecycle for MqttProducer {
    /// Producers are live from initialization on; start only verifies that
    /// the adapter was not already stopped.
    async fn start(&mut self) -> Result<(), BinderError> {
        if self.is_stopped() {
            return Err(BinderError::Outbound(OutboundError::Stopped));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        MqttProducer::stop(self).await;
    }

    fn state(&self) -> LifecycleState {
        if self.is_stopped() {
            LifecycleState::Stopped
        } else {
            LifecycleState::Running
        }
    }
}

#[async_trait]
impl Lifecycle for MqttConsumer {
    async fn start(&mut self) -> Result<(), BinderError> {
        MqttConsumer::start(self).await?;
        Ok(())
    }

    async fn stop(&mut self) {
        MqttConsumer::stop(self).await;
    }

    fn state(&self) -> LifecycleState {
        if self.is_running() {
            LifecycleState::Running
        } else {
            LifecycleState::Stopped
        }
    }
}

/// Entry point for creating bound adapters.
pub struct MqttBinder {
    binder_properties: MqttBinderProperties,
    bindings: BindingPropertiesChain,
    provisioner: MqttProvisioner,
}

impl MqttBinder {
    pub fn new(
        binder_properties: MqttBinderProperties,
        extended: MqttExtendedBindingProperties,
    ) -> Self {
        Self {
            binder_properties,
            bindings: BindingPropertiesChain::new(extended),
            provisioner: MqttProvisioner,
        }
    }

    /// Registers an extended-properties source that takes precedence over
    /// the sources configured so far.
    pub fn with_override_properties(mut self, source: MqttExtendedBindingProperties) -> Self {
        self.bindings = self.bindings.with_override(source);
        self
    }

    /// Provisions the destination and creates a connected producer.
    pub async fn new_producer_adapter(
        &self,
        destination: &str,
    ) -> Result<MqttProducer, BinderError> {
        let destination = self.provisioner.provision_producer_destination(destination)?;
        let config = self.producer_config(destination.name())?;
        let producer = MqttProducer::initialize(&config, destination.name()).await?;
        Ok(producer)
    }

    /// Provisions the destination and creates a connected consumer that
    /// delivers messages into `downstream` once started.
    pub async fn new_consumer_adapter(
        &self,
        destination: &str,
        group: Option<&str>,
        downstream: mpsc::Sender<Message>,
    ) -> Result<MqttConsumer, BinderError> {
        let destination = self
            .provisioner
            .provision_consumer_destination(destination, group)?;
        let config = self.consumer_config(destination.name())?;
        let consumer = MqttConsumer::initialize(&config, destination.name(), downstream).await?;
        Ok(consumer)
    }

    fn producer_config(&self, topic: &str) -> Result<EffectiveConnectionConfig, ConfigError> {
        let binding = self.bindings.producer_properties(topic);
        EffectiveConnectionConfig::for_producer(&self.binder_properties, &binding)
    }

    fn consumer_config(&self, topic: &str) -> Result<EffectiveConnectionConfig, ConfigError> {
        let binding = self.bindings.consumer_properties(topic);
        EffectiveConnectionConfig::for_consumer(&self.binder_properties, &binding)
    }
}
