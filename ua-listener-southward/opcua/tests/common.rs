#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::Level;
use ua_listener_opcua::{
    sdk::{Accumulator, ListenerError, ListenerResult, Metric, RetryPolicy},
    MonitoredItemRequest, MonitoredItemResult, Notification, NotificationSink, NodeSettings,
    StatusCode, SubscribeClientConfig, UaTransport, UaValue,
};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// In-process stand-in for an OPC UA server.
///
/// Reachability can be toggled, individual items can be rejected and
/// notifications are pushed by client handle into the live subscription.
/// Handles are assigned like the real client: a requested handle of 0 is
/// replaced from a counter starting at 1000, and with `remap_handles` every
/// handle is replaced.
pub struct MockTransport {
    reachable: AtomicBool,
    connected_tx: watch::Sender<bool>,
    sinks: Mutex<BTreeMap<u32, NotificationSink>>,
    next_sid: AtomicU32,
    rejected: Mutex<HashMap<String, StatusCode>>,
    fail_registration: AtomicBool,
    misconfigured: AtomicBool,
    remap_handles: AtomicBool,
    next_handle: AtomicU32,
    assigned: Mutex<HashMap<String, u32>>,
    connect_calls: AtomicUsize,
    registrations: Mutex<Vec<Vec<MonitoredItemRequest>>>,
    deleted: Mutex<Vec<u32>>,
}

impl MockTransport {
    pub fn new(reachable: bool) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            connected_tx,
            sinks: Mutex::new(BTreeMap::new()),
            next_sid: AtomicU32::new(1),
            rejected: Mutex::new(HashMap::new()),
            fail_registration: AtomicBool::new(false),
            misconfigured: AtomicBool::new(false),
            remap_handles: AtomicBool::new(false),
            next_handle: AtomicU32::new(1000),
            assigned: Mutex::new(HashMap::new()),
            connect_calls: AtomicUsize::new(0),
            registrations: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn reject_item(&self, node_id: &str, status: StatusCode) {
        self.rejected
            .lock()
            .unwrap()
            .insert(node_id.to_string(), status);
    }

    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Make `connect` fail the way unreadable client credentials do.
    pub fn set_misconfigured(&self, misconfigured: bool) {
        self.misconfigured.store(misconfigured, Ordering::SeqCst);
    }

    /// Assign every monitored item a fresh handle instead of the requested one.
    pub fn remap_handles(&self, remap: bool) {
        self.remap_handles.store(remap, Ordering::SeqCst);
    }

    /// Handle the last registration assigned to `node_id`.
    pub fn effective_handle(&self, node_id: &str) -> Option<u32> {
        self.assigned.lock().unwrap().get(node_id).copied()
    }

    /// Simulate the server going away: the session and all its
    /// subscriptions disappear.
    pub fn drop_connection(&self) {
        self.sinks.lock().unwrap().clear();
        self.connected_tx.send_replace(false);
    }

    /// Deliver a notification to the newest subscription.
    pub fn push(&self, client_handle: u32, value: UaValue, status: StatusCode) -> bool {
        let sinks = self.sinks.lock().unwrap();
        let Some((_, sink)) = sinks.iter().next_back() else {
            return false;
        };
        sink.deliver(Notification {
            client_handle,
            value,
            status,
            source_timestamp: None,
            server_timestamp: None,
        })
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> Vec<Vec<MonitoredItemRequest>> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn deleted_subscriptions(&self) -> Vec<u32> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

#[async_trait]
impl UaTransport for MockTransport {
    async fn connect(&self) -> ListenerResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.misconfigured.load(Ordering::SeqCst) {
            return Err(ListenerError::ConfigurationError(
                "reading certificate '/etc/ua/cert.pem' failed: No such file or directory"
                    .to_string(),
            ));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ListenerError::ConnectionError(
                "could not resolve address 'unreachable.invalid:4840'".to_string(),
            ));
        }
        self.connected_tx.send_replace(true);
        Ok(())
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    async fn create_subscription(
        &self,
        _interval: Duration,
        sink: NotificationSink,
    ) -> ListenerResult<u32> {
        if !*self.connected_tx.borrow() {
            return Err(ListenerError::SessionError("not connected".to_string()));
        }
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().insert(sid, sink);
        Ok(sid)
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        requests: &[MonitoredItemRequest],
    ) -> ListenerResult<Vec<MonitoredItemResult>> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(ListenerError::SubscriptionError(
                "create_monitored_items failed: BadTooManyOperations".to_string(),
            ));
        }
        self.registrations.lock().unwrap().push(requests.to_vec());
        let rejected = self.rejected.lock().unwrap();
        let remap = self.remap_handles.load(Ordering::SeqCst);
        let mut assigned = self.assigned.lock().unwrap();
        Ok(requests
            .iter()
            .enumerate()
            .map(|(i, req)| {
                let client_handle = if req.client_handle == 0 || remap {
                    self.next_handle.fetch_add(1, Ordering::SeqCst)
                } else {
                    req.client_handle
                };
                assigned.insert(req.node_id.clone(), client_handle);
                MonitoredItemResult {
                    client_handle,
                    node_id: req.node_id.clone(),
                    status: rejected
                        .get(&req.node_id)
                        .copied()
                        .unwrap_or(StatusCode::GOOD),
                    monitored_item_id: subscription_id * 1000 + i as u32,
                    revised_sampling_interval_ms: req.params.sampling_interval_ms,
                    revised_queue_size: req.params.queue_size,
                }
            })
            .collect())
    }

    async fn delete_subscription(&self, subscription_id: u32) -> ListenerResult<()> {
        self.sinks.lock().unwrap().remove(&subscription_id);
        self.deleted.lock().unwrap().push(subscription_id);
        Ok(())
    }

    async fn disconnect(&self) -> ListenerResult<()> {
        self.sinks.lock().unwrap().clear();
        self.connected_tx.send_replace(false);
        Ok(())
    }
}

/// Accumulator that keeps everything in memory.
#[derive(Default)]
pub struct MemoryAccumulator {
    metrics: Mutex<Vec<Metric>>,
    errors: Mutex<Vec<String>>,
}

impl MemoryAccumulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Wait until at least `n` metrics arrived.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Metric> {
        wait_until(timeout, || async { self.metrics.lock().unwrap().len() >= n }).await;
        self.metrics()
    }
}

impl Accumulator for MemoryAccumulator {
    fn add_metric(&self, metric: Metric) {
        self.metrics.lock().unwrap().push(metric);
    }

    fn add_error(&self, err: &ListenerError) {
        self.errors.lock().unwrap().push(err.to_string());
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn node(name: &str, namespace: &str, identifier_type: &str, identifier: &str) -> NodeSettings {
    NodeSettings {
        name: name.to_string(),
        namespace: namespace.to_string(),
        identifier_type: identifier_type.to_string(),
        identifier: identifier.to_string(),
        ..Default::default()
    }
}

/// Configuration with fast reconnection suitable for tests.
pub fn test_config(behavior: &str, nodes: Vec<NodeSettings>) -> SubscribeClientConfig {
    SubscribeClientConfig {
        name: "testing".to_string(),
        endpoint: "opc.tcp://unreachable.invalid:4840".to_string(),
        connect_fail_behavior: behavior.to_string(),
        retry_policy: RetryPolicy {
            initial_interval_ms: 10,
            max_interval_ms: 50,
            randomization_factor: 0.0,
            ..RetryPolicy::unlimited()
        },
        nodes,
        ..Default::default()
    }
}

pub const WAIT: Duration = Duration::from_secs(5);
