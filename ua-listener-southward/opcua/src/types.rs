use crate::{monitoring::CompiledMonitoringParams, status::StatusCode};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use ua_listener_sdk::{ListenerError, ListenerResult, RetryPolicy};
use url::Url;

/// Subscription client configuration.
///
/// This is the full configuration surface of the listener. Every optional key
/// has a default so a minimal configuration only needs `endpoint` and nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeClientConfig {
    /// Measurement name of emitted metrics
    pub name: String,
    /// OPC UA server endpoint URL, e.g. `opc.tcp://localhost:4840`
    pub endpoint: String,
    pub security_policy: SecurityPolicy,
    pub security_mode: SecurityMode,
    /// Path to the client certificate (PEM)
    pub certificate: Option<PathBuf>,
    /// Path to the client private key (PEM)
    pub private_key: Option<PathBuf>,
    pub auth_method: AuthMethod,
    pub username: String,
    pub password: Secret,
    /// Timeout for establishing the session
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Timeout for individual service requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Publishing interval of the subscription
    #[serde(with = "humantime_serde")]
    pub subscription_interval: Duration,
    /// One of `error`, `ignore`, `retry`; empty means `error`
    pub connect_fail_behavior: String,
    pub timestamp: TimestampSource,
    /// chrono strftime pattern for DateTime values; empty renders RFC 3339
    pub timestamp_format: String,
    pub optional_fields: Vec<OptionalField>,
    /// Root nodes, emitted under `name`
    pub nodes: Vec<crate::node::NodeSettings>,
    pub group: Vec<crate::node::NodeGroupSettings>,
    pub workarounds: Workarounds,
    /// Backoff used by the background reconnection loop
    pub retry_policy: RetryPolicy,
    /// Maximum number of monitored items per create request
    pub subscribe_batch_size: usize,
    pub application_name: String,
    pub application_uri: String,
}

impl Default for SubscribeClientConfig {
    fn default() -> Self {
        Self {
            name: "opcua".to_string(),
            endpoint: "opc.tcp://localhost:4840".to_string(),
            security_policy: SecurityPolicy::Auto,
            security_mode: SecurityMode::Auto,
            certificate: None,
            private_key: None,
            auth_method: AuthMethod::Anonymous,
            username: String::new(),
            password: Secret::default(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(20 * 60),
            subscription_interval: Duration::from_millis(100),
            connect_fail_behavior: String::new(),
            timestamp: TimestampSource::Gather,
            timestamp_format: String::new(),
            optional_fields: Vec::new(),
            nodes: Vec::new(),
            group: Vec::new(),
            workarounds: Workarounds::default(),
            retry_policy: RetryPolicy::default(),
            subscribe_batch_size: 1000,
            application_name: "ua-listener".to_string(),
            application_uri: "urn:ua-listener:client".to_string(),
        }
    }
}

impl SubscribeClientConfig {
    #[inline]
    pub fn wants_field(&self, field: OptionalField) -> bool {
        self.optional_fields.contains(&field)
    }

    /// Check the connection settings that no retry can fix: the endpoint
    /// URL and the credentials required by `auth_method`.
    pub fn validate(&self) -> ListenerResult<()> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            ListenerError::ConfigurationError(format!("invalid endpoint '{}': {e}", self.endpoint))
        })?;
        if url.scheme() != OPC_TCP_SCHEME || url.host_str().map_or(true, str::is_empty) {
            return Err(ListenerError::ConfigurationError(format!(
                "invalid endpoint '{}': expected {OPC_TCP_SCHEME}://<host>[:port]",
                self.endpoint
            )));
        }

        match self.auth_method {
            AuthMethod::Anonymous => {}
            AuthMethod::UserName if self.username.is_empty() => {
                return Err(ListenerError::ConfigurationError(
                    "username is required for auth_method 'UserName'".into(),
                ));
            }
            AuthMethod::UserName => {}
            AuthMethod::Certificate if self.certificate.is_none() || self.private_key.is_none() => {
                return Err(ListenerError::ConfigurationError(
                    "certificate and private_key are required for auth_method 'Certificate'".into(),
                ));
            }
            AuthMethod::Certificate => {}
        }
        Ok(())
    }
}

const OPC_TCP_SCHEME: &str = "opc.tcp";

/// String wrapper that never prints its content.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[inline]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

/// OPC UA security policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityPolicy {
    /// Pick the most secure endpoint the server offers
    #[default]
    #[serde(alias = "auto", alias = "")]
    Auto,
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
}

/// OPC UA message security modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityMode {
    #[default]
    #[serde(alias = "auto", alias = "")]
    Auto,
    None,
    Sign,
    SignAndEncrypt,
}

/// User identity presented when activating the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthMethod {
    #[default]
    #[serde(alias = "anonymous", alias = "")]
    Anonymous,
    #[serde(alias = "username")]
    UserName,
    #[serde(alias = "certificate")]
    Certificate,
}

/// Which timestamp a metric carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Time the notification was decoded by the client
    #[default]
    #[serde(alias = "")]
    Gather,
    Server,
    Source,
}

/// Extra fields that can be attached to each metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionalField {
    DataType,
    Quality,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workarounds {
    /// Status codes (hex `0x..` or decimal) accepted in addition to Good
    pub additional_valid_status_codes: Vec<String>,
}

/// Behavior of `start` when the initial connection cannot be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectFailBehavior {
    #[default]
    Error,
    Ignore,
    Retry,
}

impl FromStr for ConnectFailBehavior {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "error" => Ok(ConnectFailBehavior::Error),
            "ignore" => Ok(ConnectFailBehavior::Ignore),
            "retry" => Ok(ConnectFailBehavior::Retry),
            other => Err(ListenerError::ConfigurationError(format!(
                "unknown setting \"{other}\" for 'connect_fail_behavior'"
            ))),
        }
    }
}

impl fmt::Display for ConnectFailBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectFailBehavior::Error => "error",
            ConnectFailBehavior::Ignore => "ignore",
            ConnectFailBehavior::Retry => "retry",
        })
    }
}

/// Compiled monitored-item request for one node.
///
/// `client_handle` is the node's index in registration order plus one; the
/// client library treats handle 0 as "assign one for me".
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    pub client_handle: u32,
    pub node_id: String,
    pub params: CompiledMonitoringParams,
}

/// Server answer for one monitored item, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemResult {
    /// Handle notifications for this item will carry. May differ from the
    /// requested one when the client library assigns its own.
    pub client_handle: u32,
    pub node_id: String,
    pub status: StatusCode,
    pub monitored_item_id: u32,
    pub revised_sampling_interval_ms: f64,
    pub revised_queue_size: u32,
}

impl MonitoredItemResult {
    #[inline]
    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }
}

/// Classification for OPC UA monitored item creation failures.
///
/// This type groups low-level status codes into a small number of
/// categories used consistently in logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredItemFailureKind {
    /// Capacity or resource related limits (too many items, server too busy, etc.).
    CapacityOrResources,
    /// Configuration problems (invalid/unknown NodeId, bad attribute, etc.).
    Configuration,
    /// Authentication / authorization / access control problems.
    PermissionOrAuth,
    Other,
}

impl MonitoredItemFailureKind {
    /// Return a stable string label for use in structured logging.
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            MonitoredItemFailureKind::CapacityOrResources => "capacity_or_resources",
            MonitoredItemFailureKind::Configuration => "configuration",
            MonitoredItemFailureKind::PermissionOrAuth => "permission_or_auth",
            MonitoredItemFailureKind::Other => "other",
        }
    }
}

impl From<StatusCode> for MonitoredItemFailureKind {
    #[inline]
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_TOO_MANY_MONITORED_ITEMS
            | StatusCode::BAD_TOO_MANY_OPERATIONS
            | StatusCode::BAD_OUT_OF_MEMORY
            | StatusCode::BAD_RESOURCE_UNAVAILABLE
            | StatusCode::BAD_TOO_MANY_SESSIONS => MonitoredItemFailureKind::CapacityOrResources,
            StatusCode::BAD_NODE_ID_INVALID
            | StatusCode::BAD_NODE_ID_UNKNOWN
            | StatusCode::BAD_ATTRIBUTE_ID_INVALID
            | StatusCode::BAD_FILTER_NOT_ALLOWED
            | StatusCode::BAD_MONITORED_ITEM_FILTER_UNSUPPORTED => {
                MonitoredItemFailureKind::Configuration
            }
            StatusCode::BAD_USER_ACCESS_DENIED
            | StatusCode::BAD_IDENTITY_TOKEN_INVALID
            | StatusCode::BAD_IDENTITY_TOKEN_REJECTED
            | StatusCode::BAD_NOT_READABLE => MonitoredItemFailureKind::PermissionOrAuth,
            _ => MonitoredItemFailureKind::Other,
        }
    }
}
