//! Change notifications from the authoritative store.
//!
//! A notification source holds one dedicated subscription, decodes each
//! payload into a [`ChangeEvent`] and forwards it over a bounded queue.
//! Delivery never blocks the read loop indefinitely: when the queue stays
//! full for longer than the configured delivery timeout the event is dropped.
//!
//! Implementations:
//! - `PgListenerFactory`: PostgreSQL `LISTEN/NOTIFY`
//! - `MemoryNotifier`: in-process notifier for tests and local runs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod memory;
pub mod postgres;

pub use memory::MemoryNotifier;
pub use postgres::PgListenerFactory;

use crate::config::ListenerConfig;

/// Result type for notification source operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Errors that prevent a notification source from starting.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to acquire listener connection: {0}")]
    Acquire(#[source] sqlx::Error),

    #[error("failed to subscribe to channel '{channel}': {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("notification source is closed")]
    Closed,
}

/// A notification payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload has no user_id")]
    MissingSubject,
}

/// Wire shape of a replication notification.
#[derive(Debug, Deserialize)]
struct NotificationPayload {
    user_id: Option<String>,
}

/// A decoded change notification.
///
/// Events that failed to decode are still delivered so consumers can log
/// them; their `subject_id` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub subject_id: String,
    pub decode_error: Option<DecodeError>,
}

impl ChangeEvent {
    /// Event announcing that `subject_id` became visible.
    pub fn subject(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            decode_error: None,
        }
    }

    /// Event carrying a decode failure.
    pub fn malformed(error: DecodeError) -> Self {
        Self {
            subject_id: String::new(),
            decode_error: Some(error),
        }
    }

    /// Decode a raw notification payload.
    pub fn decode(payload: &str) -> Self {
        match serde_json::from_str::<NotificationPayload>(payload) {
            Ok(NotificationPayload {
                user_id: Some(user_id),
            }) if !user_id.is_empty() => Self::subject(user_id),
            Ok(_) => Self::malformed(DecodeError::MissingSubject),
            Err(e) => Self::malformed(DecodeError::Malformed(e.to_string())),
        }
    }

    /// True if this event announces `subject_id`.
    pub fn matches(&self, subject_id: &str) -> bool {
        self.decode_error.is_none() && self.subject_id == subject_id
    }
}

/// Outcome of handing one event to a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    Closed,
    Cancelled,
}

/// Enqueue `event`, waiting at most `timeout` for space.
///
/// The fast path is a non-blocking `try_send`. If the queue is full the
/// producer waits up to `timeout` and then drops the event. Cancellation of
/// `cancel` aborts the wait.
pub async fn deliver(
    tx: &mpsc::Sender<ChangeEvent>,
    event: ChangeEvent,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Delivery {
    let event = match tx.try_send(event) {
        Ok(()) => return Delivery::Sent,
        Err(mpsc::error::TrySendError::Closed(_)) => return Delivery::Closed,
        Err(mpsc::error::TrySendError::Full(event)) => event,
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        sent = tx.send_timeout(event, timeout) => match sent {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::SendTimeoutError::Timeout(dropped)) => {
                warn!(
                    subject_id = %dropped.subject_id,
                    timeout = ?timeout,
                    "Queue full, dropping change event"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Delivery::Closed,
        },
    }
}

/// A subscription that yields raw notification payloads.
///
/// `Ok(None)` means the underlying connection is gone and no further
/// payloads will arrive.
#[async_trait]
pub trait NotificationStream: Send + 'static {
    type Error: std::fmt::Display + Send;

    async fn next_payload(&mut self) -> std::result::Result<Option<String>, Self::Error>;
}

/// Read loop shared by every notification source.
///
/// Runs until cancellation, a wait error or connection loss. Dropping the
/// stream on return releases its connection; dropping `tx` closes the queue.
pub async fn pump<S: NotificationStream>(
    mut stream: S,
    tx: mpsc::Sender<ChangeEvent>,
    delivery_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Notification source cancelled");
                break;
            }
            next = stream.next_payload() => next,
        };

        let payload = match next {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                info!("Notification connection lost, closing source");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Notification wait failed, closing source");
                break;
            }
        };

        let event = ChangeEvent::decode(&payload);
        if let Some(err) = &event.decode_error {
            debug!(error = %err, "Forwarding undecodable notification");
        }

        match deliver(&tx, event, delivery_timeout, &cancel).await {
            Delivery::Sent | Delivery::Dropped => {}
            Delivery::Closed => {
                debug!("Event queue receiver gone, closing source");
                break;
            }
            Delivery::Cancelled => break,
        }
    }
}

struct ReleaseInner {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ReleaseInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Idempotent release of a running notification source.
///
/// Clones share state. The first release stops the source and joins its
/// task; any other caller waits for that join and then returns. When the
/// last clone is dropped without an explicit release the source is still
/// signalled.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<ReleaseInner>,
}

impl ReleaseHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            inner: Arc::new(ReleaseInner {
                cancel,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Stop the source and wait until its connection is released.
    pub async fn release(&self) {
        self.inner.cancel.cancel();
        // Held across the join so a concurrent caller returns only once the
        // task is gone.
        let mut slot = self.inner.task.lock().await;
        if let Some(task) = slot.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Notification source task panicked");
                }
            }
        }
    }

    /// True once the source task has been joined.
    pub async fn is_released(&self) -> bool {
        self.inner.task.lock().await.is_none()
    }
}

/// A started notification source.
pub struct ListenerHandle {
    events: mpsc::Receiver<ChangeEvent>,
    release: ReleaseHandle,
}

impl ListenerHandle {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, release: ReleaseHandle) -> Self {
        Self { events, release }
    }

    /// Spawn `pump` over `stream` and return its handle.
    ///
    /// The source stops on its own child of `lifetime`, so cancelling the
    /// caller's token stops it as well.
    pub fn spawn<S: NotificationStream>(
        stream: S,
        settings: &ListenerConfig,
        lifetime: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let cancel = lifetime.child_token();
        let task = tokio::spawn(pump(
            stream,
            tx,
            settings.delivery_timeout(),
            cancel.clone(),
        ));
        Self::new(rx, ReleaseHandle::new(cancel, task))
    }

    /// Next event, or `None` once the source has closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> std::result::Result<ChangeEvent, mpsc::error::TryRecvError> {
        self.events.try_recv()
    }

    pub fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    pub async fn release(&self) {
        self.release.release().await;
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ChangeEvent>, ReleaseHandle) {
        (self.events, self.release)
    }
}

/// Starts notification sources.
///
/// Starting acquires the source's dedicated connection and subscribes; any
/// failure there is returned synchronously.
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn start(&self, lifetime: &CancellationToken) -> Result<ListenerHandle>;
}
