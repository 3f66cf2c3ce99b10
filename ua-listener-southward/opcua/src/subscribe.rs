use crate::{
    codec::ValueCodec,
    node::{self, NodeDescriptor},
    status::StatusPolicy,
    transport::{Notification, NotificationSink, UaTransport, NOTIFICATION_QUEUE_CAPACITY},
    types::{
        MonitoredItemFailureKind, MonitoredItemRequest, MonitoredItemResult, OptionalField,
        SubscribeClientConfig, TimestampSource,
    },
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use ua_listener_sdk::{ConnectionState, ListenerError, ListenerResult, Metric};

/// Capacity of the decoded metric channel returned by `start_stream_values`.
pub const METRIC_QUEUE_CAPACITY: usize = 1024;

/// Turns notifications into metric records.
#[derive(Debug, Clone)]
pub(crate) struct MetricBuilder {
    codec: ValueCodec,
    status_policy: StatusPolicy,
    timestamp: TimestampSource,
    with_quality: bool,
    with_data_type: bool,
}

impl MetricBuilder {
    fn new(config: &SubscribeClientConfig) -> ListenerResult<Self> {
        Ok(Self {
            codec: ValueCodec::new(config.timestamp_format.clone())?,
            status_policy: StatusPolicy::from_codes(
                &config.workarounds.additional_valid_status_codes,
            )?,
            timestamp: config.timestamp,
            with_quality: config.wants_field(OptionalField::Quality),
            with_data_type: config.wants_field(OptionalField::DataType),
        })
    }

    /// Build the metric for `n`; `None` when it would carry no field.
    pub(crate) fn build(
        &self,
        node: &NodeDescriptor,
        n: &Notification,
        gathered_at: DateTime<Utc>,
    ) -> Option<Metric> {
        let timestamp = match self.timestamp {
            TimestampSource::Gather => gathered_at,
            TimestampSource::Server => n.server_timestamp.unwrap_or(gathered_at),
            TimestampSource::Source => n.source_timestamp.unwrap_or(gathered_at),
        };

        let mut metric = Metric::new(node.metric_name.clone(), timestamp);
        for (k, v) in &node.tags {
            metric.tags.insert(k.clone(), v.clone());
        }
        metric.tags.insert("id".to_string(), node.node_id());

        if self.status_policy.is_ok(n.status) {
            if let Some(value) = self.codec.to_field(&n.value) {
                metric.fields.insert(node.field_name.clone(), value);
            }
        } else {
            tracing::debug!(
                node_id = %node.node_id(),
                status = %n.status,
                "Status not OK; value field omitted"
            );
        }
        if self.with_quality {
            metric
                .fields
                .insert("Quality".to_string(), n.status.quality().into());
        }
        if self.with_data_type {
            metric
                .fields
                .insert("DataType".to_string(), n.value.type_name().into());
        }

        (!metric.fields.is_empty()).then_some(metric)
    }
}

/// Subscription manager for one OPC UA server.
///
/// Owns the resolved nodes and their monitored-item requests, the connection
/// state machine and the per-item registration results of the current
/// subscription. Requests are kept across reconnects so every new
/// subscription registers exactly the same items.
pub struct SubscribeClient {
    config: Arc<SubscribeClientConfig>,
    transport: Arc<dyn UaTransport>,
    nodes: Arc<Vec<NodeDescriptor>>,
    requests: ArcSwap<Vec<MonitoredItemRequest>>,
    registration: ArcSwap<Vec<MonitoredItemResult>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Serializes connect attempts and state transitions
    connect_lock: Mutex<()>,
    /// Bumped on every successful connect; a stream only reports the loss of
    /// the session it was started on
    epoch: AtomicU64,
    builder: MetricBuilder,
}

impl SubscribeClient {
    /// Validate the configuration and prepare the monitored-item requests.
    pub fn new(
        config: Arc<SubscribeClientConfig>,
        transport: Arc<dyn UaTransport>,
    ) -> ListenerResult<Self> {
        config.validate()?;
        let nodes = node::resolve_nodes(&config)?;
        let builder = MetricBuilder::new(&config)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let client = Self {
            config,
            transport,
            nodes: Arc::new(nodes),
            requests: ArcSwap::from_pointee(Vec::new()),
            registration: ArcSwap::from_pointee(Vec::new()),
            state_tx,
            connect_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            builder,
        };
        client.setup_options();
        Ok(client)
    }

    /// Build one monitored-item request per node, client handle = node
    /// index + 1.
    pub fn setup_options(&self) {
        let requests: Vec<MonitoredItemRequest> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, d)| MonitoredItemRequest {
                client_handle: i as u32 + 1,
                node_id: d.node_id(),
                params: d.monitoring,
            })
            .collect();
        self.requests.store(Arc::new(requests));
    }

    #[inline]
    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    #[inline]
    pub fn monitored_item_requests(&self) -> Arc<Vec<MonitoredItemRequest>> {
        self.requests.load_full()
    }

    /// Per-item results of the most recent registration, in request order.
    #[inline]
    pub fn registration_results(&self) -> Arc<Vec<MonitoredItemResult>> {
        self.registration.load_full()
    }

    #[inline]
    pub fn config(&self) -> &SubscribeClientConfig {
        &self.config
    }

    /// Current state; a session the transport reports as gone reads as
    /// `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        match *self.state_tx.borrow() {
            ConnectionState::Connected if !self.transport.is_connected() => {
                ConnectionState::Disconnected
            }
            s => s,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Establish the session. Concurrent callers wait for the attempt in
    /// flight and return immediately if it succeeded.
    pub async fn connect(&self) -> ListenerResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.state_tx.send_replace(ConnectionState::Connecting);
        tracing::debug!(endpoint = %self.config.endpoint, "Connecting to OPC UA server");
        match self.transport.connect().await {
            Ok(()) => {
                self.epoch.fetch_add(1, Ordering::AcqRel);
                self.state_tx.send_replace(ConnectionState::Connected);
                tracing::info!(endpoint = %self.config.endpoint, "Connected to OPC UA server");
                Ok(())
            }
            Err(e) => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the session and mark the client disconnected.
    pub async fn disconnect(&self) -> ListenerResult<()> {
        let _guard = self.connect_lock.lock().await;
        let res = self.transport.disconnect().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        res
    }

    /// Mark the session started at `epoch` as lost. A newer session is left
    /// untouched.
    async fn mark_disconnected(&self, epoch: u64) {
        let _guard = self.connect_lock.lock().await;
        if self.epoch.load(Ordering::Acquire) == epoch
            && *self.state_tx.borrow() == ConnectionState::Connected
        {
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Create the subscription, register all monitored items and start
    /// decoding notifications into metrics.
    ///
    /// The returned channel closes when `cancel` fires or the session is lost.
    pub async fn start_stream_values(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> ListenerResult<mpsc::Receiver<Metric>> {
        if self.state() != ConnectionState::Connected {
            return Err(ListenerError::InvalidStateError(format!(
                "cannot start streaming while {}",
                self.state()
            )));
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let (sink, raw_rx) = NotificationSink::channel(NOTIFICATION_QUEUE_CAPACITY);
        let sid = self
            .transport
            .create_subscription(self.config.subscription_interval, sink)
            .await?;

        let requests = self.requests.load_full();
        let results = match self.transport.create_monitored_items(sid, &requests).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(subscription_id = sid, error = %e, "Monitored item registration failed");
                if let Err(del) = self.transport.delete_subscription(sid).await {
                    tracing::debug!(subscription_id = sid, error = %del, "Subscription cleanup failed");
                }
                return Err(e);
            }
        };

        let handles = acknowledged_handles(sid, &requests, &results);
        tracing::info!(
            subscription_id = sid,
            requested = requests.len(),
            registered = handles.len(),
            "OPC UA monitored items registered"
        );
        self.registration.store(Arc::new(results));

        let (metric_tx, metric_rx) = mpsc::channel(METRIC_QUEUE_CAPACITY);
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client
                .decode_loop(sid, epoch, handles, raw_rx, metric_tx, cancel)
                .await;
        });
        Ok(metric_rx)
    }

    async fn decode_loop(
        &self,
        sid: u32,
        epoch: u64,
        handles: HashMap<u32, usize>,
        mut raw_rx: mpsc::Receiver<Notification>,
        metric_tx: mpsc::Sender<Metric>,
        cancel: CancellationToken,
    ) {
        let mut connected = self.transport.watch_connected();
        let mut lost = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connected.changed() => {
                    if changed.is_err() || !*connected.borrow_and_update() {
                        lost = true;
                        break;
                    }
                }
                maybe = raw_rx.recv() => {
                    let Some(n) = maybe else {
                        lost = true;
                        break;
                    };
                    let Some(&idx) = handles.get(&n.client_handle) else {
                        tracing::warn!(
                            subscription_id = sid,
                            client_handle = n.client_handle,
                            "Notification for unknown client handle; dropping"
                        );
                        continue;
                    };
                    let Some(metric) = self.builder.build(&self.nodes[idx], &n, Utc::now()) else {
                        continue;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = metric_tx.send(metric) => {
                            if sent.is_err() {
                                tracing::debug!(subscription_id = sid, "Metric receiver dropped");
                                break;
                            }
                        }
                    }
                }
            }
        }

        drop(metric_tx);
        if lost {
            tracing::warn!(subscription_id = sid, "OPC UA session lost; stream ended");
            self.mark_disconnected(epoch).await;
        } else if let Err(e) = self.transport.delete_subscription(sid).await {
            tracing::debug!(subscription_id = sid, error = %e, "Subscription cleanup failed");
        } else {
            tracing::info!(subscription_id = sid, "OPC UA subscription deleted");
        }
    }
}

/// Map the client handle of every accepted item to its node index.
///
/// Results come back in request order, so position identifies the node; the
/// handle is taken from the result since the client library may have
/// replaced the requested one. Rejected items are logged and left out.
fn acknowledged_handles(
    sid: u32,
    requests: &[MonitoredItemRequest],
    results: &[MonitoredItemResult],
) -> HashMap<u32, usize> {
    if results.len() != requests.len() {
        tracing::error!(
            subscription_id = sid,
            expected = requests.len(),
            actual = results.len(),
            "Monitored item results do not match requests"
        );
    }

    let mut handles = HashMap::with_capacity(results.len());
    for (idx, (req, res)) in requests.iter().zip(results).enumerate() {
        if req.node_id != res.node_id {
            tracing::warn!(
                subscription_id = sid,
                expected = %req.node_id,
                actual = %res.node_id,
                "Monitored item result out of order; skipping"
            );
            continue;
        }
        if !res.is_good() {
            let failure_kind = MonitoredItemFailureKind::from(res.status);
            tracing::warn!(
                subscription_id = sid,
                node_id = %res.node_id,
                status = %res.status,
                failure_kind = failure_kind.as_str(),
                "OPC UA monitored item creation failed for node"
            );
            continue;
        }
        tracing::debug!(
            subscription_id = sid,
            node_id = %res.node_id,
            client_handle = res.client_handle,
            monitored_item_id = res.monitored_item_id,
            revised_sampling_ms = res.revised_sampling_interval_ms,
            revised_queue_size = res.revised_queue_size,
            "OPC UA monitored item created"
        );
        if handles.insert(res.client_handle, idx).is_some() {
            tracing::warn!(
                subscription_id = sid,
                client_handle = res.client_handle,
                "Duplicate client handle in monitored item results"
            );
        }
    }
    handles
}
