use crate::{
    codec::UaValue,
    status::StatusCode,
    types::{MonitoredItemRequest, MonitoredItemResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use ua_listener_sdk::ListenerResult;

/// Capacity of the raw notification queue between transport and decoder.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

/// One data-change notification as delivered by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub client_handle: u32,
    pub value: UaValue,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Producer side of the notification queue handed to the transport.
///
/// Delivery never blocks the transport's dispatch path: when the queue is
/// full the notification is dropped and counted.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::Sender<Notification>,
    dropped: Arc<AtomicU64>,
}

impl NotificationSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Returns `false` when the notification could not be queued.
    pub fn deliver(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    client_handle = n.client_handle,
                    dropped,
                    "Notification queue full; dropping notification"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                tracing::debug!(
                    client_handle = n.client_handle,
                    "Notification queue closed; dropping notification"
                );
                false
            }
        }
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Operations the subscription manager needs from an OPC UA client stack.
#[async_trait]
pub trait UaTransport: Send + Sync {
    /// Establish a session. Resolves once the session is usable.
    async fn connect(&self) -> ListenerResult<()>;

    /// Receiver that flips to `false` when the session is lost.
    fn watch_connected(&self) -> watch::Receiver<bool>;

    fn is_connected(&self) -> bool {
        *self.watch_connected().borrow()
    }

    /// Create a subscription publishing at `interval`; returns its id.
    async fn create_subscription(
        &self,
        interval: Duration,
        sink: NotificationSink,
    ) -> ListenerResult<u32>;

    /// Register monitored items; results are returned in request order.
    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        requests: &[MonitoredItemRequest],
    ) -> ListenerResult<Vec<MonitoredItemResult>>;

    async fn delete_subscription(&self, subscription_id: u32) -> ListenerResult<()>;

    /// Close the session. Safe to call when not connected.
    async fn disconnect(&self) -> ListenerResult<()>;
}
