//! Fan-in of several notification sources into one stream.
//!
//! One forwarding task per source copies events into a shared bounded queue.
//! Forwarders run in a `JoinSet`; [`FanIn::stop`] cancels them, joins every
//! one and only then releases the sources, so a stopped multiplexer has no
//! task or connection left behind.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FanInConfig;
use crate::notify::{deliver, ChangeEvent, Delivery, ListenerHandle, ReleaseHandle};

/// Merged view over zero or more listener handles.
pub struct FanIn {
    events: mpsc::Receiver<ChangeEvent>,
    stop: CancellationToken,
    forwarders: JoinSet<()>,
    releases: Vec<ReleaseHandle>,
}

impl FanIn {
    /// Start one forwarder per handle.
    pub fn start(handles: Vec<ListenerHandle>, settings: &FanInConfig) -> Self {
        let (tx, events) = mpsc::channel(settings.queue_capacity.max(1));
        let stop = CancellationToken::new();
        let mut forwarders = JoinSet::new();
        let mut releases = Vec::with_capacity(handles.len());

        for (source, handle) in handles.into_iter().enumerate() {
            let (rx, release) = handle.into_parts();
            releases.push(release);
            forwarders.spawn(forward(
                source,
                rx,
                tx.clone(),
                settings.delivery_timeout(),
                stop.clone(),
            ));
        }

        debug!(sources = releases.len(), "Fan-in started");

        Self {
            events,
            stop,
            forwarders,
            releases,
        }
    }

    /// Number of sources being merged.
    pub fn sources(&self) -> usize {
        self.releases.len()
    }

    /// Next merged event, or `None` once every source has closed.
    ///
    /// With zero sources this returns `None` immediately.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Stop every forwarder, wait for all of them, then release every source.
    pub async fn stop(mut self) {
        self.stop.cancel();
        while let Some(joined) = self.forwarders.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!("Fan-in forwarder panicked");
                }
            }
        }
        for release in &self.releases {
            release.release().await;
        }
        info!(sources = self.releases.len(), "Fan-in stopped");
    }
}

impl Drop for FanIn {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn forward(
    source: usize,
    mut rx: mpsc::Receiver<ChangeEvent>,
    tx: mpsc::Sender<ChangeEvent>,
    delivery_timeout: Duration,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    debug!(source, "Source closed, forwarder exiting");
                    break;
                }
            },
        };

        match deliver(&tx, event, delivery_timeout, &stop).await {
            Delivery::Sent | Delivery::Dropped => {}
            Delivery::Closed | Delivery::Cancelled => break,
        }
    }
}
