use crate::{listener::OpcUaListener, supervisor::OpcUaTransport, types::SubscribeClientConfig};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use std::{path::Path, sync::Arc};
use tracing::info;
use ua_listener_sdk::{ListenerError, ListenerResult};

/// Prefix of environment overrides, e.g. `UA_LISTENER__ENDPOINT`.
pub const ENV_PREFIX: &str = "UA_LISTENER";

/// Builds listeners wired to the async-opcua transport.
#[derive(Debug, Clone, Default)]
pub struct OpcUaListenerFactory;

impl OpcUaListenerFactory {
    /// Load the configuration from a TOML file, applying environment overrides.
    pub fn load_file(path: impl AsRef<Path>) -> ListenerResult<SubscribeClientConfig> {
        let path = path.as_ref();
        let source = File::from(path).format(FileFormat::Toml).required(true);
        Self::finish(Config::builder().add_source(source)).map_err(|e| match e {
            ListenerError::ConfigurationError(msg) => ListenerError::ConfigurationError(format!(
                "{}: {msg}",
                path.display()
            )),
            other => other,
        })
    }

    /// Load the configuration from a TOML string, applying environment overrides.
    pub fn load_str(toml: &str) -> ListenerResult<SubscribeClientConfig> {
        Self::finish(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> ListenerResult<SubscribeClientConfig> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| ListenerError::ConfigurationError(format!("invalid configuration: {e}")))
    }

    /// Create a listener for `config`.
    pub fn create(&self, config: SubscribeClientConfig) -> ListenerResult<OpcUaListener> {
        info!(
            endpoint = %config.endpoint,
            nodes = config.nodes.len(),
            groups = config.group.len(),
            "Creating OPC UA listener"
        );
        let transport = Arc::new(OpcUaTransport::new(Arc::new(config.clone())));
        OpcUaListener::init(config, transport)
    }

    pub fn create_from_file(&self, path: impl AsRef<Path>) -> ListenerResult<OpcUaListener> {
        self.create(Self::load_file(path)?)
    }

    pub fn create_from_str(&self, toml: &str) -> ListenerResult<OpcUaListener> {
        self.create(Self::load_str(toml)?)
    }
}
