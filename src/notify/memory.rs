//! In-process notification source.
//!
//! Uses a tokio broadcast channel in place of a database subscription.
//! Every started listener receives every payload published after it started.
//! Useful for tests and local development without PostgreSQL.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    ListenerFactory, ListenerHandle, NotificationStream, NotifyError, ReleaseHandle, Result,
};
use crate::config::ListenerConfig;

/// Broadcast capacity for raw payloads.
const BROADCAST_CAPACITY: usize = 1024;

struct BroadcastStream {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl NotificationStream for BroadcastStream {
    type Error = std::convert::Infallible;

    async fn next_payload(&mut self) -> std::result::Result<Option<String>, Self::Error> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Memory notifier lagged, skipped payloads");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// In-memory [`ListenerFactory`].
pub struct MemoryNotifier {
    sender: Mutex<Option<broadcast::Sender<String>>>,
    settings: ListenerConfig,
    fail_on_start: AtomicBool,
    started: AtomicUsize,
    releases: Mutex<Vec<ReleaseHandle>>,
}

impl MemoryNotifier {
    pub fn new(settings: ListenerConfig) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender: Mutex::new(Some(sender)),
            settings,
            fail_on_start: AtomicBool::new(false),
            started: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
        }
    }

    /// Announce that `subject_id` has replicated.
    pub fn notify(&self, subject_id: &str) -> usize {
        self.notify_raw(&serde_json::json!({ "user_id": subject_id }).to_string())
    }

    /// Publish a raw payload. Returns the number of listeners reached.
    pub fn notify_raw(&self, payload: &str) -> usize {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.send(payload.to_string()).unwrap_or(0),
            None => 0,
        }
    }

    /// Simulate loss of every listener connection.
    pub fn disconnect(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Make subsequent `start` calls fail as if no connection could be acquired.
    pub fn set_fail_on_start(&self, fail: bool) {
        self.fail_on_start.store(fail, Ordering::SeqCst);
    }

    /// Number of listeners started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// True if every listener started so far has been released.
    pub async fn all_released(&self) -> bool {
        let releases: Vec<ReleaseHandle> = self
            .releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for release in releases {
            if !release.is_released().await {
                return false;
            }
        }
        true
    }
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new(ListenerConfig::default())
    }
}

#[async_trait]
impl ListenerFactory for MemoryNotifier {
    async fn start(&self, lifetime: &CancellationToken) -> Result<ListenerHandle> {
        if self.fail_on_start.load(Ordering::SeqCst) {
            return Err(NotifyError::Acquire(sqlx::Error::PoolTimedOut));
        }

        let receiver = {
            let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            sender.as_ref().ok_or(NotifyError::Closed)?.subscribe()
        };

        let stream = BroadcastStream { receiver };
        let handle = ListenerHandle::spawn(stream, &self.settings, lifetime);
        self.started.fetch_add(1, Ordering::SeqCst);
        self.releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.release_handle());

        Ok(handle)
    }
}
