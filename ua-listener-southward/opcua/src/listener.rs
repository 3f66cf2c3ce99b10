use crate::{
    subscribe::SubscribeClient,
    transport::UaTransport,
    types::{ConnectFailBehavior, SubscribeClientConfig},
};
use backoff::backoff::Backoff;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ua_listener_sdk::{
    build_exponential_backoff, Accumulator, ConnectionState, ListenerError, ListenerResult,
    Metric, RetryPolicy,
};

/// OPC UA listener plugin.
///
/// Streams data changes of the configured nodes into an [`Accumulator`] and
/// keeps the subscription alive across connection failures according to
/// `connect_fail_behavior`.
#[derive(Clone)]
pub struct OpcUaListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    client: Arc<SubscribeClient>,
    behavior: ConnectFailBehavior,
    retry_policy: RetryPolicy,
    /// Root token; replaced when the listener is started again after a stop
    cancel: StdMutex<CancellationToken>,
    acc: StdMutex<Option<Arc<dyn Accumulator>>>,
    /// Serializes connect + stream setup between start, gather and the retry loop
    stream_guard: Mutex<()>,
    /// Generation of the live stream, 0 when none
    active_stream: AtomicU64,
    next_stream: AtomicU64,
    reconnecting: AtomicBool,
    stopping: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl OpcUaListener {
    /// Validate the configuration and build the subscription client.
    /// No connection is made.
    #[instrument(skip_all)]
    pub fn init(
        config: SubscribeClientConfig,
        transport: Arc<dyn UaTransport>,
    ) -> ListenerResult<Self> {
        let behavior: ConnectFailBehavior = config.connect_fail_behavior.parse()?;
        let retry_policy = config.retry_policy;
        let client = SubscribeClient::new(Arc::new(config), transport)?;
        tracing::debug!(
            nodes = client.nodes().len(),
            connect_fail_behavior = %behavior,
            "OPC UA listener initialized"
        );

        Ok(Self {
            inner: Arc::new(ListenerInner {
                client: Arc::new(client),
                behavior,
                retry_policy,
                cancel: StdMutex::new(CancellationToken::new()),
                acc: StdMutex::new(None),
                stream_guard: Mutex::new(()),
                active_stream: AtomicU64::new(0),
                next_stream: AtomicU64::new(1),
                reconnecting: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// Connect and start streaming into `acc`.
    ///
    /// A failed initial connect is handled per `connect_fail_behavior`:
    /// `error` returns it, `ignore` stays disconnected until the next
    /// `gather`, `retry` reconnects in the background.
    #[instrument(skip_all)]
    pub async fn start(&self, acc: Arc<dyn Accumulator>) -> ListenerResult<()> {
        let inner = &self.inner;
        inner.stopping.store(false, Ordering::Release);
        inner.renew_cancel_token();
        if let Ok(mut slot) = inner.acc.lock() {
            *slot = Some(acc);
        }

        let err = match inner.connect_and_stream().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match inner.behavior {
            ConnectFailBehavior::Error => {
                tracing::error!(error = %err, "Initial connect failed");
                Err(err)
            }
            ConnectFailBehavior::Ignore => {
                tracing::warn!(error = %err, "Initial connect failed; continuing disconnected");
                Ok(())
            }
            ConnectFailBehavior::Retry => {
                tracing::warn!(error = %err, "Initial connect failed; retrying in background");
                inner.spawn_reconnect();
                Ok(())
            }
        }
    }

    /// Periodic collection hook. Values arrive through the stream, so this
    /// only re-establishes the connection when it is down.
    #[instrument(skip_all)]
    pub async fn gather(&self) -> ListenerResult<()> {
        let inner = &self.inner;
        if inner.is_streaming() {
            return Ok(());
        }
        inner.connect_and_stream().await
    }

    /// Cancel streaming and reconnection, wait for background tasks and
    /// close the session.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> ListenerResult<()> {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);
        inner.cancel_token().cancel();

        loop {
            let pending: Vec<JoinHandle<()>> = match inner.tasks.lock() {
                Ok(mut tasks) => tasks.drain(..).collect(),
                Err(_) => Vec::new(),
            };
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }

        inner.active_stream.store(0, Ordering::Release);
        let res = inner.client.disconnect().await;
        tracing::info!("OPC UA listener stopped");
        res
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.inner.client.state()
    }

    #[inline]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    #[inline]
    pub fn client(&self) -> &Arc<SubscribeClient> {
        &self.inner.client
    }
}

impl ListenerInner {
    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn renew_cancel_token(&self) {
        let mut token = match self.cancel.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    #[inline]
    fn is_streaming(&self) -> bool {
        self.active_stream.load(Ordering::Acquire) != 0
            && self.client.state() == ConnectionState::Connected
    }

    fn accumulator(&self) -> Option<Arc<dyn Accumulator>> {
        self.acc.lock().ok().and_then(|acc| acc.clone())
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|h| !h.is_finished());
            tasks.push(handle);
        }
    }

    async fn connect_and_stream(self: &Arc<Self>) -> ListenerResult<()> {
        let _guard = self.stream_guard.lock().await;
        let root = self.cancel_token();
        if root.is_cancelled() {
            return Err(ListenerError::InvalidStateError("listener is stopped".into()));
        }
        if self.is_streaming() {
            return Ok(());
        }

        self.client.connect().await?;

        let stream_cancel = root.child_token();
        let rx = match self.client.start_stream_values(stream_cancel).await {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(de) = self.client.disconnect().await {
                    tracing::debug!(error = %de, "Disconnect after failed stream start");
                }
                return Err(e);
            }
        };

        let generation = self.next_stream.fetch_add(1, Ordering::AcqRel);
        self.active_stream.store(generation, Ordering::Release);
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move { this.forward(generation, rx).await }));
        Ok(())
    }

    /// Hand metrics to the accumulator until the stream closes. A stream
    /// that ends outside of `stop` triggers reconnection.
    async fn forward(self: Arc<Self>, generation: u64, mut rx: mpsc::Receiver<Metric>) {
        let acc = self.accumulator();
        let mut forwarded: u64 = 0;
        while let Some(metric) = rx.recv().await {
            forwarded += 1;
            if let Some(acc) = &acc {
                acc.add_metric(metric);
            }
        }
        tracing::debug!(generation, forwarded, "Metric stream closed");

        // A newer stream already replaced this one.
        if self
            .active_stream
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.stopping.load(Ordering::Acquire) || self.cancel_token().is_cancelled() {
            return;
        }
        tracing::warn!("OPC UA stream ended unexpectedly; reconnecting");
        self.spawn_reconnect();
    }

    /// Start the background reconnection loop unless one is running.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            tracing::debug!("Reconnection already in progress");
            return;
        }
        let cancel = self.cancel_token().child_token();
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            loop {
                let reconnected = this.reconnect_loop(&cancel).await;
                this.reconnecting.store(false, Ordering::Release);
                // A stream that died before the flag was cleared could not
                // schedule its own reconnect.
                if !reconnected
                    || cancel.is_cancelled()
                    || this.is_streaming()
                    || this.reconnecting.swap(true, Ordering::AcqRel)
                {
                    break;
                }
            }
        }));
    }

    /// Returns `true` once streaming was re-established. A configuration
    /// error ends the loop.
    async fn reconnect_loop(self: &Arc<Self>, cancel: &CancellationToken) -> bool {
        let mut bo = build_exponential_backoff(&self.retry_policy);
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            if self.retry_policy.exhausted(attempt) {
                tracing::error!(attempt, "OPC UA reconnection attempts exhausted");
                return false;
            }
            let Some(delay) = bo.next_backoff() else {
                tracing::error!(attempt, "OPC UA reconnection time budget exhausted");
                return false;
            };
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "OPC UA reconnect scheduled"
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_and_stream().await {
                Ok(()) => {
                    tracing::info!(attempt, "OPC UA reconnected");
                    return true;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return false;
                    }
                    if let Some(acc) = self.accumulator() {
                        acc.add_error(&e);
                    }
                    if e.is_configuration() {
                        tracing::error!(attempt, error = %e, "OPC UA reconnect aborted");
                        return false;
                    }
                    tracing::warn!(attempt, error = %e, "OPC UA reconnect failed");
                }
            }
        }
    }
}
