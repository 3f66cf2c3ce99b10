use crate::{
    codec::UaValue,
    monitoring::CompiledMonitoringParams,
    status::StatusCode,
    transport::{Notification, NotificationSink, UaTransport},
    types::{
        AuthMethod, MonitoredItemRequest, MonitoredItemResult, SecurityMode, SecurityPolicy,
        SubscribeClientConfig,
    },
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use opcua::{
    client::{
        ClientBuilder, IdentityToken, MonitoredItem, Password, Session, SessionActivity,
        SessionEventLoop, SessionPollResult, SubscriptionCallbacks,
    },
    crypto::{PrivateKey, SecurityPolicy as UaSecurityPolicy, X509},
    types::{
        enums::MonitoringMode, DataChangeFilter as UaDataChangeFilter,
        DataChangeTrigger as UaDataChangeTrigger, DataValue, EndpointDescription,
        ExtensionObject, MessageSecurityMode, MonitoredItemCreateRequest, MonitoredItemCreateResult,
        MonitoringParameters as UaMonitoringParameters, NodeId, ReadValueId,
        TimestampsToReturn, Variant,
    },
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use ua_listener_sdk::{ListenerError, ListenerResult};
use url::Url;

const DEFAULT_OPC_TCP_PORT: u16 = 4840;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Event loop task of the current session.
struct EventLoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// `UaTransport` backed by the async-opcua client.
///
/// One session at a time. Automatic session reconnects of the client stack
/// are disabled; a lost session is reported through `watch_connected` and
/// the listener decides when to reconnect.
pub struct OpcUaTransport {
    config: Arc<SubscribeClientConfig>,
    session: ArcSwapOption<Session>,
    connected_tx: watch::Sender<bool>,
    event_loop: Mutex<Option<EventLoopHandle>>,
}

impl OpcUaTransport {
    pub fn new(config: Arc<SubscribeClientConfig>) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            config,
            session: ArcSwapOption::from(None),
            connected_tx,
            event_loop: Mutex::new(None),
        }
    }

    #[inline]
    fn session(&self) -> ListenerResult<Arc<Session>> {
        self.session
            .load_full()
            .ok_or_else(|| ListenerError::SessionError("OPC UA session not established".into()))
    }

    #[inline]
    async fn with_timeout<T, F>(&self, fut: F) -> ListenerResult<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| ListenerError::Timeout(self.config.request_timeout))
    }

    #[inline]
    fn build_client(cfg: &SubscribeClientConfig) -> ClientBuilder {
        // An application instance certificate is needed for signed / encrypted
        // channels and for X509 user identities.
        let requires_secure_channel = !matches!(cfg.security_policy, SecurityPolicy::None)
            && !matches!(cfg.security_mode, SecurityMode::None);
        let uses_x509_identity = matches!(cfg.auth_method, AuthMethod::Certificate);
        let needs_app_cert = requires_secure_channel || uses_x509_identity;

        let mut builder = ClientBuilder::new()
            .application_name(&cfg.application_name)
            .application_uri(&cfg.application_uri)
            .pki_dir("./pki")
            .session_retry_limit(0)
            .session_timeout(cfg.session_timeout.as_millis().min(u32::MAX as u128) as u32);

        if let (Some(cert), Some(key)) = (&cfg.certificate, &cfg.private_key) {
            builder = builder.certificate_path(cert).private_key_path(key);
        }

        if needs_app_cert {
            builder = builder
                .trust_server_certs(true)
                .create_sample_keypair(cfg.certificate.is_none());
        } else {
            builder = builder
                .trust_server_certs(false)
                .create_sample_keypair(false);
        }
        builder
    }

    async fn identity(cfg: &SubscribeClientConfig) -> ListenerResult<IdentityToken> {
        match cfg.auth_method {
            AuthMethod::Anonymous => Ok(IdentityToken::Anonymous),
            AuthMethod::UserName => {
                if cfg.username.is_empty() {
                    return Err(ListenerError::ConfigurationError(
                        "username is required for auth_method 'UserName'".into(),
                    ));
                }
                Ok(IdentityToken::UserName(
                    cfg.username.clone(),
                    Password::new(cfg.password.expose().to_string()),
                ))
            }
            AuthMethod::Certificate => {
                let (Some(cert_path), Some(key_path)) = (&cfg.certificate, &cfg.private_key) else {
                    return Err(ListenerError::ConfigurationError(
                        "certificate and private_key are required for auth_method 'Certificate'"
                            .into(),
                    ));
                };
                let cert = tokio::fs::read(cert_path).await.map_err(|e| {
                    ListenerError::ConfigurationError(format!(
                        "reading certificate '{}' failed: {e}",
                        cert_path.display()
                    ))
                })?;
                let key = tokio::fs::read(key_path).await.map_err(|e| {
                    ListenerError::ConfigurationError(format!(
                        "reading private key '{}' failed: {e}",
                        key_path.display()
                    ))
                })?;
                Ok(IdentityToken::X509(
                    Box::new(
                        X509::from_pem(&cert)
                            .map_err(|e| ListenerError::ConfigurationError(e.to_string()))?,
                    ),
                    Box::new(
                        PrivateKey::from_pem(&key)
                            .map_err(|e| ListenerError::ConfigurationError(e.to_string()))?,
                    ),
                ))
            }
        }
    }

    /// Resolve the endpoint host before talking to the server so that an
    /// unknown host fails fast with a clear message.
    async fn resolve_endpoint(endpoint: &str) -> ListenerResult<Url> {
        let url = Url::parse(endpoint).map_err(|e| {
            ListenerError::ConfigurationError(format!("invalid endpoint '{endpoint}': {e}"))
        })?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port().unwrap_or(DEFAULT_OPC_TCP_PORT);
        let addr = format!("{host}:{port}");
        let resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .map(|mut it| it.next().is_some())
            .unwrap_or(false);
        if !resolved {
            return Err(ListenerError::ConnectionError(format!(
                "could not resolve address '{addr}'"
            )));
        }
        Ok(url)
    }

    /// Pick the endpoint matching the configured policy and mode. `Auto`
    /// accepts anything and prefers the highest security level.
    fn select_endpoint(
        cfg: &SubscribeClientConfig,
        endpoints: Vec<EndpointDescription>,
    ) -> ListenerResult<EndpointDescription> {
        let desired_policy = ua_security_policy(cfg.security_policy);
        let desired_mode = ua_security_mode(cfg.security_mode);

        endpoints
            .into_iter()
            .filter(|ep| {
                desired_mode.map_or(true, |m| ep.security_mode == m)
                    && desired_policy.map_or(true, |p| {
                        UaSecurityPolicy::from_uri(ep.security_policy_uri.as_ref()) == p
                    })
            })
            .max_by_key(|ep| ep.security_level)
            .ok_or_else(|| {
                ListenerError::ConnectionError(format!(
                    "no OPC UA endpoint matches security policy {:?} and mode {:?} for URL {}",
                    cfg.security_policy, cfg.security_mode, cfg.endpoint
                ))
            })
    }

    /// Servers often advertise a host name that is not reachable from the
    /// client; the configured host and port win.
    fn override_host(selected: &mut EndpointDescription, configured: &Url) {
        let original_endpoint_url = selected.endpoint_url.clone();
        if let Ok(mut ep_uri) = Url::parse(selected.endpoint_url.as_ref()) {
            if let Some(host) = configured.host_str() {
                if let Err(err) = ep_uri.set_host(Some(host)) {
                    tracing::debug!(
                        error = ?err,
                        "Failed to override OPC UA endpoint host; keeping server advertised host"
                    );
                }
            }
            if let Some(port) = configured.port() {
                if ep_uri.set_port(Some(port)).is_err() {
                    tracing::debug!(
                        "Failed to override OPC UA endpoint port; keeping server advertised port"
                    );
                }
            }
            selected.endpoint_url = ep_uri.to_string().into();
        }

        tracing::info!(
            endpoint_url = %selected.endpoint_url,
            original_endpoint_url = %original_endpoint_url,
            security_policy_uri = %selected.security_policy_uri,
            security_mode = ?selected.security_mode,
            security_level = selected.security_level,
            "OPC UA selected endpoint for connection"
        );
    }

    async fn connect_once(
        cfg: &SubscribeClientConfig,
    ) -> ListenerResult<(Arc<Session>, SessionEventLoop)> {
        let url = Self::resolve_endpoint(cfg.endpoint.trim()).await?;

        let mut client = Self::build_client(cfg).client().map_err(|e| {
            ListenerError::SessionError(format!("OPC UA build client error: {e:?}"))
        })?;
        let identity = Self::identity(cfg).await?;

        let endpoints = client
            .get_server_endpoints_from_url(url.as_str())
            .await
            .map_err(|err| {
                ListenerError::ConnectionError(format!(
                    "OPC UA get endpoints error from {url}: {err}"
                ))
            })?;
        for ep in &endpoints {
            tracing::debug!(
                endpoint_url = %ep.endpoint_url,
                security_policy_uri = %ep.security_policy_uri,
                security_mode = ?ep.security_mode,
                "OPC UA discovered endpoint"
            );
        }

        let mut selected = Self::select_endpoint(cfg, endpoints)?;
        Self::override_host(&mut selected, &url);

        client
            .connect_to_endpoint_directly(selected, identity)
            .map_err(|e| ListenerError::ConnectionError(format!("OPC UA connect error: {e}")))
    }

    /// Drive the session event loop until cancelled or the session ends.
    ///
    /// `ready` resolves on the first successful connect or the first failure.
    async fn run_event_loop(
        session: Arc<Session>,
        ev: SessionEventLoop,
        cancel: CancellationToken,
        connected_tx: watch::Sender<bool>,
        ready: oneshot::Sender<ListenerResult<()>>,
    ) {
        let mut ready = Some(ready);
        let stream = ev.enter();
        pin_mut!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.disable_reconnects();
                    let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, session.disconnect()).await;
                    connected_tx.send_replace(false);
                    return;
                }
                maybe_item = stream.next() => {
                    match maybe_item {
                        Some(Ok(SessionPollResult::Reconnected(_))) => {
                            connected_tx.send_replace(true);
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Some(Ok(SessionPollResult::SessionActivity(act))) => match act {
                            SessionActivity::KeepAliveSucceeded => {}
                            SessionActivity::KeepAliveFailed(code) => {
                                tracing::warn!(status = %code, "OPC UA keep-alive failed");
                            }
                        },
                        Some(Ok(SessionPollResult::ConnectionLost(code))) => {
                            tracing::warn!(status = %code, "OPC UA connection lost");
                            connected_tx.send_replace(false);
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Err(ListenerError::ConnectionError(format!(
                                    "connection lost: {code}"
                                ))));
                            }
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(code)) => {
                            tracing::warn!(status = %code, "OPC UA session event loop error");
                            connected_tx.send_replace(false);
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Err(ListenerError::ConnectionError(format!(
                                    "OPC UA session error: {code}"
                                ))));
                            }
                            return;
                        }
                        None => {
                            connected_tx.send_replace(false);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn stop_event_loop(&self) {
        let handle = self.event_loop.lock().await.take();
        if let Some(EventLoopHandle { cancel, task }) = handle {
            cancel.cancel();
            let _ = task.await;
        }
        self.session.store(None);
        self.connected_tx.send_replace(false);
    }
}

#[async_trait]
impl UaTransport for OpcUaTransport {
    async fn connect(&self) -> ListenerResult<()> {
        self.stop_event_loop().await;

        let cfg = Arc::clone(&self.config);
        let connect_timeout = cfg.connect_timeout;
        let attempt = async {
            let (session, ev) = Self::connect_once(&cfg).await?;
            let cancel = CancellationToken::new();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(Self::run_event_loop(
                Arc::clone(&session),
                ev,
                cancel.clone(),
                self.connected_tx.clone(),
                ready_tx,
            ));
            *self.event_loop.lock().await = Some(EventLoopHandle { cancel, task });

            match ready_rx.await {
                Ok(Ok(())) => {
                    self.session.store(Some(session));
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ListenerError::ConnectionError(
                    "OPC UA session event loop ended before connecting".into(),
                )),
            }
        };

        let res = match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(res) => res,
            Err(_) => Err(ListenerError::Timeout(connect_timeout)),
        };
        if res.is_err() {
            self.stop_event_loop().await;
        } else {
            tracing::info!(endpoint = %self.config.endpoint, "OPC UA session connected");
        }
        res
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    async fn create_subscription(
        &self,
        interval: Duration,
        sink: NotificationSink,
    ) -> ListenerResult<u32> {
        let session = self.session()?;
        let callbacks = make_callbacks(sink);
        let sid = self
            .with_timeout(session.create_subscription(interval, 60, 20, 0, 0, true, callbacks))
            .await?
            .map_err(|e| {
                ListenerError::SubscriptionError(format!(
                    "Failed to create OPC UA subscription: {e}"
                ))
            })?;
        tracing::info!(
            subscription_id = sid,
            interval_ms = interval.as_millis() as u64,
            "OPC UA subscription created"
        );
        Ok(sid)
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        requests: &[MonitoredItemRequest],
    ) -> ListenerResult<Vec<MonitoredItemResult>> {
        let session = self.session()?;
        let chunk = self.config.subscribe_batch_size.max(1);
        let mut out = Vec::with_capacity(requests.len());

        for batch in requests.chunks(chunk) {
            // Requests whose node id does not parse never reach the server.
            let mut wire = Vec::with_capacity(batch.len());
            let mut slots: Vec<Option<MonitoredItemResult>> = Vec::with_capacity(batch.len());
            for req in batch {
                match build_request(req) {
                    Some(r) => {
                        wire.push(r);
                        slots.push(None);
                    }
                    None => {
                        tracing::warn!(node_id = %req.node_id, "Node id could not be parsed");
                        slots.push(Some(rejected(req, StatusCode::BAD_NODE_ID_INVALID)));
                    }
                }
            }

            let mut results = if wire.is_empty() {
                Vec::new().into_iter()
            } else {
                self.with_timeout(session.create_monitored_items(
                    subscription_id,
                    TimestampsToReturn::Both,
                    wire,
                ))
                .await?
                .map_err(|e| {
                    ListenerError::SubscriptionError(format!(
                        "OPC UA create_monitored_items failed: {e}"
                    ))
                })?
                .into_iter()
            };

            for (req, slot) in batch.iter().zip(slots) {
                if let Some(done) = slot {
                    out.push(done);
                    continue;
                }
                match results.next() {
                    Some(res) => out.push(created(
                        req,
                        res.requested_parameters.client_handle,
                        &res.result,
                    )),
                    None => {
                        tracing::error!(
                            subscription_id,
                            client_handle = req.client_handle,
                            "OPC UA create_monitored_items returned fewer results than requested"
                        );
                        out.push(rejected(req, StatusCode::BAD_UNEXPECTED_ERROR));
                    }
                }
            }
        }

        Ok(out)
    }

    async fn delete_subscription(&self, subscription_id: u32) -> ListenerResult<()> {
        let session = self.session()?;
        self.with_timeout(session.delete_subscription(subscription_id))
            .await?
            .map(|_| ())
            .map_err(|e| {
                ListenerError::SubscriptionError(format!(
                    "Failed to delete OPC UA subscription {subscription_id}: {e}"
                ))
            })
    }

    async fn disconnect(&self) -> ListenerResult<()> {
        self.stop_event_loop().await;
        Ok(())
    }
}

/// Result for an item the server answered. The client library hands out
/// its own handle when the requested one is 0, so `client_handle` is the one
/// it actually registered.
fn created(
    req: &MonitoredItemRequest,
    client_handle: u32,
    res: &MonitoredItemCreateResult,
) -> MonitoredItemResult {
    MonitoredItemResult {
        client_handle,
        node_id: req.node_id.clone(),
        status: StatusCode(res.status_code.bits()),
        monitored_item_id: res.monitored_item_id,
        revised_sampling_interval_ms: res.revised_sampling_interval,
        revised_queue_size: res.revised_queue_size,
    }
}

#[inline]
fn rejected(req: &MonitoredItemRequest, status: StatusCode) -> MonitoredItemResult {
    MonitoredItemResult {
        client_handle: req.client_handle,
        node_id: req.node_id.clone(),
        status,
        monitored_item_id: 0,
        revised_sampling_interval_ms: 0.0,
        revised_queue_size: 0,
    }
}

#[inline]
fn ua_security_policy(policy: SecurityPolicy) -> Option<UaSecurityPolicy> {
    Some(match policy {
        SecurityPolicy::Auto => return None,
        SecurityPolicy::None => UaSecurityPolicy::None,
        SecurityPolicy::Basic128Rsa15 => UaSecurityPolicy::Basic128Rsa15,
        SecurityPolicy::Basic256 => UaSecurityPolicy::Basic256,
        SecurityPolicy::Basic256Sha256 => UaSecurityPolicy::Basic256Sha256,
        SecurityPolicy::Aes128Sha256RsaOaep => UaSecurityPolicy::Aes128Sha256RsaOaep,
        SecurityPolicy::Aes256Sha256RsaPss => UaSecurityPolicy::Aes256Sha256RsaPss,
    })
}

#[inline]
fn ua_security_mode(mode: SecurityMode) -> Option<MessageSecurityMode> {
    match mode {
        SecurityMode::Auto => None,
        SecurityMode::None => Some(MessageSecurityMode::None),
        SecurityMode::Sign => Some(MessageSecurityMode::Sign),
        SecurityMode::SignAndEncrypt => Some(MessageSecurityMode::SignAndEncrypt),
    }
}

fn build_request(req: &MonitoredItemRequest) -> Option<MonitoredItemCreateRequest> {
    let node_id = NodeId::from_str(&req.node_id).ok()?;
    Some(MonitoredItemCreateRequest {
        item_to_monitor: ReadValueId::new_value(node_id),
        monitoring_mode: MonitoringMode::Reporting,
        requested_parameters: wire_parameters(req.client_handle, &req.params),
    })
}

fn wire_parameters(client_handle: u32, params: &CompiledMonitoringParams) -> UaMonitoringParameters {
    let filter = match params.filter {
        Some(f) => ExtensionObject::from_message(UaDataChangeFilter {
            trigger: match f.trigger.code() {
                0 => UaDataChangeTrigger::Status,
                1 => UaDataChangeTrigger::StatusValue,
                _ => UaDataChangeTrigger::StatusValueTimestamp,
            },
            deadband_type: f.deadband_type.code(),
            deadband_value: f.deadband_value,
        }),
        None => ExtensionObject::default(),
    };
    UaMonitoringParameters {
        client_handle,
        sampling_interval: params.sampling_interval_ms,
        filter,
        queue_size: params.queue_size,
        discard_oldest: params.discard_oldest,
    }
}

#[inline]
fn make_callbacks(sink: NotificationSink) -> SubscriptionCallbacks {
    SubscriptionCallbacks::new(
        |status| {
            tracing::debug!(?status, "OPC UA subscription status change");
        },
        move |dv: DataValue, item: &MonitoredItem| {
            sink.deliver(notification_from(dv, item.client_handle()));
        },
        |_event, _item| {},
    )
}

fn notification_from(dv: DataValue, client_handle: u32) -> Notification {
    Notification {
        client_handle,
        value: dv.value.as_ref().map(variant_value).unwrap_or(UaValue::Null),
        status: dv
            .status
            .map(|s| StatusCode(s.bits()))
            .unwrap_or(StatusCode::GOOD),
        source_timestamp: dv.source_timestamp.map(|t| t.as_chrono()),
        server_timestamp: dv.server_timestamp.map(|t| t.as_chrono()),
    }
}

fn variant_value(variant: &Variant) -> UaValue {
    match variant {
        Variant::Empty => UaValue::Null,
        Variant::Boolean(v) => UaValue::Boolean(*v),
        Variant::SByte(v) => UaValue::SByte(*v),
        Variant::Byte(v) => UaValue::Byte(*v),
        Variant::Int16(v) => UaValue::Int16(*v),
        Variant::UInt16(v) => UaValue::UInt16(*v),
        Variant::Int32(v) => UaValue::Int32(*v),
        Variant::UInt32(v) => UaValue::UInt32(*v),
        Variant::Int64(v) => UaValue::Int64(*v),
        Variant::UInt64(v) => UaValue::UInt64(*v),
        Variant::Float(v) => UaValue::Float(*v),
        Variant::Double(v) => UaValue::Double(*v),
        Variant::String(s) => UaValue::String(s.as_ref().to_string()),
        Variant::DateTime(dt) => UaValue::DateTime(dt.as_chrono()),
        Variant::Guid(g) => UaValue::Guid(g.to_string()),
        Variant::ByteString(b) => UaValue::ByteString(b.as_ref().to_vec()),
        Variant::StatusCode(code) => UaValue::StatusCode(StatusCode(code.bits())),
        Variant::Array(arr) => UaValue::Array(arr.values.iter().map(variant_value).collect()),
        Variant::LocalizedText(_) => UaValue::Unsupported("LocalizedText"),
        Variant::QualifiedName(_) => UaValue::Unsupported("QualifiedName"),
        Variant::NodeId(_) => UaValue::Unsupported("NodeId"),
        Variant::ExtensionObject(_) => UaValue::Unsupported("ExtensionObject"),
        _ => UaValue::Unsupported("Variant"),
    }
}
