//! MQTT v5 binder for message-driven applications
//!
//! Bridges a generic message abstraction to MQTT v5 topics over rumqttc.
//! A [`binder::MqttBinder`] resolves layered configuration into per-binding
//! connection settings and hands out two adapter kinds:
//!
//! * [`outbound::MqttProducer`] publishes one message per invocation at
//!   QoS at-least-once, honoring per-message topic overrides.
//! * [`inbound::MqttConsumer`] subscribes to a topic and runs a worker
//!   loop that projects every publication into a message, carrying the
//!   MQTT metadata as headers.
//!
//! Each adapter owns its broker connection. The initial connect is
//! blocking and fatal on failure; later link loss is retried with
//! exponential backoff while the adapter keeps running.

pub mod binder;
pub mod codec;
pub mod config;
pub mod connection;
pub mod inbound;
pub mod message;
pub mod outbound;

pub use binder::{
    BinderError, Lifecycle, LifecycleState, MqttBinder, MqttProvisioner, ProvisioningError,
    TopicDestination,
};
pub use config::{MqttBinderProperties, MqttExtendedBindingProperties};
pub use inbound::MqttConsumer;
pub use message::{headers, HeaderValue, Message, Payload};
pub use outbound::MqttProducer;
