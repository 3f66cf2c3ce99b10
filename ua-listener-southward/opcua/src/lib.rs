mod codec;
mod factory;
mod listener;
mod monitoring;
mod node;
mod status;
mod subscribe;
mod supervisor;
mod transport;
mod types;

pub use codec::{UaValue, ValueCodec};
pub use factory::{OpcUaListenerFactory, ENV_PREFIX};
pub use listener::OpcUaListener;
pub use monitoring::{
    compile as compile_monitoring_params, CompiledMonitoringParams, DataChangeFilter,
    DataChangeTrigger, DeadbandKind, MonitoringParameters, WireDataChangeFilter,
    DEFAULT_DISCARD_OLDEST, DEFAULT_QUEUE_SIZE,
};
pub use node::{
    expand_group, merge_tags, node_id_string, resolve_node, resolve_nodes, IdentifierType,
    NodeDescriptor, NodeGroupSettings, NodeSettings,
};
pub use status::{StatusCode, StatusPolicy};
pub use subscribe::{SubscribeClient, METRIC_QUEUE_CAPACITY};
pub use supervisor::OpcUaTransport;
pub use transport::{Notification, NotificationSink, UaTransport, NOTIFICATION_QUEUE_CAPACITY};
pub use types::{
    AuthMethod, ConnectFailBehavior, MonitoredItemFailureKind, MonitoredItemRequest,
    MonitoredItemResult, OptionalField, Secret, SecurityMode, SecurityPolicy,
    SubscribeClientConfig, TimestampSource, Workarounds,
};

/// Re-exported so integration code can name the shared types without a
/// separate dependency.
pub use ua_listener_sdk as sdk;
