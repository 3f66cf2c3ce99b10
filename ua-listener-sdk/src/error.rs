use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Listener specific errors
#[derive(Error, Debug, Default)]
pub enum ListenerError {
    #[error("Service unavailable")]
    #[default]
    ServiceUnavailable,
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Subscription error: {0}")]
    SubscriptionError(String),
    #[error("Invalid state error: {0}")]
    InvalidStateError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),
}

impl ListenerError {
    /// Configuration errors are fatal for the whole listener; everything else
    /// is transient from the listener's point of view.
    #[inline]
    pub fn is_configuration(&self) -> bool {
        matches!(self, ListenerError::ConfigurationError(_))
    }
}

impl<T> From<mpsc::error::SendError<T>> for ListenerError {
    fn from(err: mpsc::error::SendError<T>) -> Self {
        ListenerError::SubscriptionError(format!("Channel send failed: {err}"))
    }
}

pub type ListenerResult<T> = Result<T, ListenerError>;
