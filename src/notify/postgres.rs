//! PostgreSQL `LISTEN/NOTIFY` notification source.
//!
//! Each started listener takes one connection out of the pool and keeps it
//! for its whole lifetime. The connection is closed when the source task
//! ends, whichever way it ends.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ListenerFactory, ListenerHandle, NotificationStream, NotifyError, Result};
use crate::config::ListenerConfig;

/// `PgListener` in non-reconnecting mode.
///
/// `try_recv` yields `None` once when the connection drops; the source
/// treats that as the end of the subscription instead of reconnecting.
struct PgNotificationStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    type Error = sqlx::Error;

    async fn next_payload(&mut self) -> std::result::Result<Option<String>, Self::Error> {
        let notification = self.listener.try_recv().await?;
        Ok(notification.map(|n| {
            debug!(channel = n.channel(), pid = n.process_id(), "Notification received");
            n.payload().to_string()
        }))
    }
}

/// Starts `LISTEN` subscriptions on a PostgreSQL channel.
#[derive(Clone)]
pub struct PgListenerFactory {
    pool: PgPool,
    settings: ListenerConfig,
}

impl PgListenerFactory {
    pub fn new(pool: PgPool, settings: ListenerConfig) -> Self {
        Self { pool, settings }
    }
}

#[async_trait]
impl ListenerFactory for PgListenerFactory {
    #[tracing::instrument(
        name = "notify.start",
        skip_all,
        fields(channel = %self.settings.channel)
    )]
    async fn start(&self, lifetime: &CancellationToken) -> Result<ListenerHandle> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(NotifyError::Acquire)?;

        listener
            .listen(&self.settings.channel)
            .await
            .map_err(|source| NotifyError::Subscribe {
                channel: self.settings.channel.clone(),
                source,
            })?;

        info!(
            channel = %self.settings.channel,
            queue_capacity = self.settings.queue_capacity,
            "Listening for change notifications"
        );

        Ok(ListenerHandle::spawn(
            PgNotificationStream { listener },
            &self.settings,
            lifetime,
        ))
    }
}
