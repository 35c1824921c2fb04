//! Binder configuration and per-destination resolution
//!
//! Three property layers feed one adapter:
//!
//! ```text
//! MqttBinderProperties          binder-wide host/credentials/TLS defaults
//!          │
//! BindingPropertiesChain        extended per-destination sources, queried
//!          │                    in precedence order (override source first)
//!          ▼
//! EffectiveConnectionConfig     immutable, resolved once per adapter
//! ```
//!
//! Resolution failures are fatal: an adapter whose configuration does not
//! resolve never reaches a connected state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Default client identifier for producer (sink) bindings.
pub const DEFAULT_SINK_CLIENT_ID: &str = "stream.client.id.sink";
/// Default client identifier for consumer (source) bindings.
pub const DEFAULT_SOURCE_CLIENT_ID: &str = "stream.client.id.source";

/// MQTT v3/v5 protocol bound on client identifier length.
const CLIENT_ID_MAX_LEN: usize = 23;

const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Client identifiers must be 1-23 characters (protocol limit).
    #[error("invalid client id `{0}`: must be 1-23 characters")]
    InvalidClientId(String),

    /// The configured trust store could not be read.
    #[error("failed to read trust store `{path}`: {source}")]
    UnreadableTrustStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read configuration file `{path}`: {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Binder-wide connection defaults, prefix-compatible with the upstream
/// property surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttBinderProperties {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Bound on the initial broker handshake, in seconds.
    pub connection_timeout_secs: u64,
    /// One-way TLS trust material; TLS is enabled only when this is set.
    pub trust_store: Option<TrustStoreProperties>,
}

impl Default for MqttBinderProperties {
    fn default() -> Self {
        Self {
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            trust_store: None,
        }
    }
}

impl MqttBinderProperties {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Trust store backing the one-way TLS context (broker verification only;
/// client certificates are out of scope).
#[derive(Debug, Clone, Deserialize)]
pub struct TrustStoreProperties {
    pub path: PathBuf,
    #[serde(default)]
    pub kind: TrustStoreKind,
    /// Accepted for surface compatibility; PEM stores are not encrypted,
    /// so a configured password is ignored with a warning.
    #[serde(default)]
    pub password: Option<String>,
}

impl TrustStoreProperties {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TrustStoreKind::Pem,
            password: None,
        }
    }

    /// Loads the PEM CA material for the TLS context.
    pub fn load(&self) -> Result<Vec<u8>, ConfigError> {
        if self.password.is_some() {
            warn!(path = %self.path.display(), "trust store password is ignored for pem stores");
        }
        std::fs::read(&self.path).map_err(|source| ConfigError::UnreadableTrustStore {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStoreKind {
    #[default]
    Pem,
}

/// Extended consumer (source) binding properties.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttSourceProperties {
    /// Identifies the client; 1-23 characters.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSourceProperties {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_SOURCE_CLIENT_ID.to_string(),
            username: None,
            password: None,
        }
    }
}

/// Extended producer (sink) binding properties.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttSinkProperties {
    /// Identifies the client; 1-23 characters.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSinkProperties {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_SINK_CLIENT_ID.to_string(),
            username: None,
            password: None,
        }
    }
}

/// Consumer and producer extension pair for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttBindingProperties {
    pub consumer: MqttSourceProperties,
    pub producer: MqttSinkProperties,
}

/// One extended-properties source: per-destination entries plus the
/// source's own defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttExtendedBindingProperties {
    pub defaults: MqttBindingProperties,
    pub bindings: HashMap<String, MqttBindingProperties>,
}

impl MqttExtendedBindingProperties {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}

/// Precedence-ordered lookup chain over extended-properties sources.
///
/// Sources are queried front to back; the first one carrying an explicit
/// entry for the destination wins. When no source has an entry, the primary
/// source's defaults apply.
#[derive(Debug, Clone, Default)]
pub struct BindingPropertiesChain {
    /// Highest precedence first; the primary source is last.
    sources: Vec<MqttExtendedBindingProperties>,
}

impl BindingPropertiesChain {
    pub fn new(primary: MqttExtendedBindingProperties) -> Self {
        Self {
            sources: vec![primary],
        }
    }

    /// Prepends a source that takes precedence over everything added so far.
    pub fn with_override(mut self, source: MqttExtendedBindingProperties) -> Self {
        self.sources.insert(0, source);
        self
    }

    pub fn consumer_properties(&self, destination: &str) -> MqttSourceProperties {
        self.lookup(destination)
            .map(|binding| binding.consumer.clone())
            .unwrap_or_else(|| self.defaults().consumer.clone())
    }

    pub fn producer_properties(&self, destination: &str) -> MqttSinkProperties {
        self.lookup(destination)
            .map(|binding| binding.producer.clone())
            .unwrap_or_else(|| self.defaults().producer.clone())
    }

    fn lookup(&self, destination: &str) -> Option<&MqttBindingProperties> {
        self.sources
            .iter()
            .find_map(|source| source.bindings.get(destination))
    }

    fn defaults(&self) -> &MqttBindingProperties {
        static FALLBACK: std::sync::OnceLock<MqttBindingProperties> = std::sync::OnceLock::new();
        self.sources
            .last()
            .map(|source| &source.defaults)
            .unwrap_or_else(|| FALLBACK.get_or_init(MqttBindingProperties::default))
    }
}

/// Connection and credential configuration for exactly one adapter.
///
/// Immutable after resolution; a reinitialized adapter resolves a fresh one.
#[derive(Debug, Clone)]
pub struct EffectiveConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub connection_timeout: Duration,
    pub trust_store: Option<TrustStoreProperties>,
}

impl EffectiveConnectionConfig {
    pub fn for_producer(
        binder: &MqttBinderProperties,
        binding: &MqttSinkProperties,
    ) -> Result<Self, ConfigError> {
        Self::resolve(
            binder,
            &binding.client_id,
            binding.username.as_deref(),
            binding.password.as_deref(),
        )
    }

    pub fn for_consumer(
        binder: &MqttBinderProperties,
        binding: &MqttSourceProperties,
    ) -> Result<Self, ConfigError> {
        Self::resolve(
            binder,
            &binding.client_id,
            binding.username.as_deref(),
            binding.password.as_deref(),
        )
    }

    fn resolve(
        binder: &MqttBinderProperties,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if client_id.trim().is_empty() || client_id.len() > CLIENT_ID_MAX_LEN {
            return Err(ConfigError::InvalidClientId(client_id.to_string()));
        }

        // Binding credentials apply only as a complete pair; a lone username
        // or password falls back to the binder-wide pair.
        let (username, password) = match (username, password) {
            (Some(user), Some(pass)) => (user.to_string(), pass.to_string()),
            _ => (binder.username.clone(), binder.password.clone()),
        };

        Ok(Self {
            host: binder.host.clone(),
            port: binder.port,
            username,
            password,
            client_id: client_id.to_string(),
            connection_timeout: Duration::from_secs(binder.connection_timeout_secs),
            trust_store: binder.trust_store.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binder() -> MqttBinderProperties {
        MqttBinderProperties::default()
    }

    #[test]
    fn binder_defaults_match_upstream() {
        let props = binder();
        assert_eq!(props.username, "guest");
        assert_eq!(props.password, "guest");
        assert_eq!(props.host, "localhost");
        assert_eq!(props.port, 1883);
        assert!(props.trust_store.is_none());
    }

    #[test]
    fn binder_properties_parse_from_toml() {
        let props = MqttBinderProperties::from_toml_str(
            r#"
            host = "broker.internal"
            port = 8883
            username = "svc"
            password = "secret"

            [trust_store]
            path = "/etc/broker/ca.pem"
            kind = "pem"
            "#,
        )
        .unwrap();

        assert_eq!(props.host, "broker.internal");
        assert_eq!(props.port, 8883);
        let trust_store = props.trust_store.unwrap();
        assert_eq!(trust_store.path, PathBuf::from("/etc/broker/ca.pem"));
        assert_eq!(trust_store.kind, TrustStoreKind::Pem);
    }

    #[test]
    fn default_client_ids_fit_protocol_limit() {
        assert!(DEFAULT_SINK_CLIENT_ID.len() <= 23);
        assert!(DEFAULT_SOURCE_CLIENT_ID.len() <= 23);
        assert!(EffectiveConnectionConfig::for_producer(
            &binder(),
            &MqttSinkProperties::default()
        )
        .is_ok());
        assert!(EffectiveConnectionConfig::for_consumer(
            &binder(),
            &MqttSourceProperties::default()
        )
        .is_ok());
    }

    #[test]
    fn client_id_outside_bounds_fails_resolution() {
        let too_long = MqttSinkProperties {
            client_id: "x".repeat(24),
            ..Default::default()
        };
        let blank = MqttSinkProperties {
            client_id: "   ".to_string(),
            ..Default::default()
        };

        assert!(matches!(
            EffectiveConnectionConfig::for_producer(&binder(), &too_long),
            Err(ConfigError::InvalidClientId(_))
        ));
        assert!(matches!(
            EffectiveConnectionConfig::for_producer(&binder(), &blank),
            Err(ConfigError::InvalidClientId(_))
        ));

        let exactly_23 = MqttSinkProperties {
            client_id: "x".repeat(23),
            ..Default::default()
        };
        assert!(EffectiveConnectionConfig::for_producer(&binder(), &exactly_23).is_ok());
    }

    #[test]
    fn binding_credentials_override_as_a_pair() {
        let binding = MqttSourceProperties {
            username: Some("binding-user".to_string()),
            password: Some("binding-pass".to_string()),
            ..Default::default()
        };

        let config = EffectiveConnectionConfig::for_consumer(&binder(), &binding).unwrap();
        assert_eq!(config.username, "binding-user");
        assert_eq!(config.password, "binding-pass");
    }

    #[test]
    fn partial_binding_credentials_fall_back_to_binder_pair() {
        let binding = MqttSourceProperties {
            username: Some("binding-user".to_string()),
            password: None,
            ..Default::default()
        };

        let config = EffectiveConnectionConfig::for_consumer(&binder(), &binding).unwrap();
        assert_eq!(config.username, "guest");
        assert_eq!(config.password, "guest");
    }

    #[test]
    fn override_source_wins_over_primary() {
        let mut primary = MqttExtendedBindingProperties::default();
        primary.bindings.insert(
            "telemetry".to_string(),
            MqttBindingProperties {
                producer: MqttSinkProperties {
                    client_id: "primary-sink".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let mut runtime = MqttExtendedBindingProperties::default();
        runtime.bindings.insert(
            "telemetry".to_string(),
            MqttBindingProperties {
                producer: MqttSinkProperties {
                    client_id: "runtime-sink".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let chain = BindingPropertiesChain::new(primary).with_override(runtime);
        assert_eq!(
            chain.producer_properties("telemetry").client_id,
            "runtime-sink"
        );
    }

    #[test]
    fn missing_override_entry_falls_through_to_primary() {
        let mut primary = MqttExtendedBindingProperties::default();
        primary.bindings.insert(
            "telemetry".to_string(),
            MqttBindingProperties {
                consumer: MqttSourceProperties {
                    client_id: "primary-source".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let chain = BindingPropertiesChain::new(primary)
            .with_override(MqttExtendedBindingProperties::default());
        assert_eq!(
            chain.consumer_properties("telemetry").client_id,
            "primary-source"
        );
    }

    #[test]
    fn unknown_destination_uses_primary_defaults() {
        let chain = BindingPropertiesChain::new(MqttExtendedBindingProperties::default());
        assert_eq!(
            chain.consumer_properties("missing").client_id,
            DEFAULT_SOURCE_CLIENT_ID
        );
        assert_eq!(
            chain.producer_properties("missing").client_id,
            DEFAULT_SINK_CLIENT_ID
        );
    }

    #[test]
    fn unreadable_trust_store_fails_load() {
        let store = TrustStoreProperties::new("/nonexistent/ca.pem");
        assert!(matches!(
            store.load(),
            Err(ConfigError::UnreadableTrustStore { .. })
        ));
    }
}
