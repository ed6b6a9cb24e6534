//! Database side of the relay
//!
//! An [`UpstreamListener`] holds one dedicated database connection per active
//! channel, subscribes it to the channel and pushes every notification into
//! the channel's relay.

pub mod memory;
mod postgres;

pub use memory::MemoryPool;
pub use postgres::{PgConnectionPool, PgListenConnection, PostgresConfig};

use crate::relay::{Notification, Relay, RelayError, RelayPool};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("failed to acquire database connection: {0}")]
    Acquire(String),

    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid connection settings: {0}")]
    InvalidConfig(String),
}

/// A notification as it comes off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

/// Source of dedicated, long-lived database connections
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire_dedicated(&self) -> Result<Box<dyn Connection>, UpstreamError>;
}

/// A connection able to receive asynchronous notifications
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, command: &str) -> Result<(), UpstreamError>;

    /// Wait for the next notification on any channel this connection listens to
    async fn wait_for_notification(&mut self) -> Result<RawNotification, UpstreamError>;

    /// Give the connection back. Safe to call more than once.
    async fn release(&mut self);
}

/// Why a listener stopped
#[derive(Debug, Clone)]
pub enum ListenerExit {
    Shutdown,
    /// The relay was closed from the subscriber side (no subscribers left)
    RelayClosed,
    Failed(UpstreamError),
}

/// Task bridging one database channel into its relay
pub struct UpstreamListener {
    db: Arc<dyn ConnectionPool>,
    relays: RelayPool,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

impl UpstreamListener {
    pub fn new(
        db: Arc<dyn ConnectionPool>,
        relays: RelayPool,
        relay: Arc<Relay>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            relays,
            relay,
            shutdown,
        }
    }

    /// Run until shutdown, relay closure or a database failure
    ///
    /// The relay is always evicted from the pool before this returns, so every
    /// subscriber observes the end of the channel as a disconnect.
    pub async fn run(self) -> ListenerExit {
        let channel = self.relay.channel().clone();

        let acquired = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ListenerExit::Shutdown),
            _ = self.relay.closed() => Err(ListenerExit::RelayClosed),
            conn = self.db.acquire_dedicated() => conn.map_err(ListenerExit::Failed),
        };
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(exit) => {
                if let ListenerExit::Failed(e) = &exit {
                    warn!(channel = %channel, error = %e, "could not acquire listener connection");
                }
                self.relays.evict(&self.relay);
                return exit;
            }
        };

        info!(channel = %channel, "listening to database channel");
        let exit = self.pump(conn.as_mut()).await;

        self.relays.evict(&self.relay);
        conn.release().await;

        match &exit {
            ListenerExit::Failed(e) => warn!(channel = %channel, error = %e, "database listener failed"),
            other => info!(channel = %channel, reason = ?other, "stopped listening to database channel"),
        }
        exit
    }

    async fn pump(&self, conn: &mut dyn Connection) -> ListenerExit {
        let channel = self.relay.channel();
        let command = channel.listen_command();

        let listened = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return ListenerExit::Shutdown,
            _ = self.relay.closed() => return ListenerExit::RelayClosed,
            result = conn.execute(&command) => result,
        };
        if let Err(e) = listened {
            return ListenerExit::Failed(e);
        }

        loop {
            let raw = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return ListenerExit::Shutdown,
                _ = self.relay.closed() => return ListenerExit::RelayClosed,
                next = conn.wait_for_notification() => match next {
                    Ok(raw) => raw,
                    Err(e) => return ListenerExit::Failed(e),
                },
            };

            if raw.channel != channel.as_str() {
                debug!(channel = %channel, received = %raw.channel, "ignoring notification for another channel");
                continue;
            }
            debug!(channel = %channel, payload = %raw.payload, "NOTIFY received");

            let notification = Notification::new(channel.clone(), raw.payload);
            let published = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return ListenerExit::Shutdown,
                published = self.relay.publish(notification) => published,
            };
            match published {
                Ok(delivered) => debug!(channel = %channel, delivered, "notification relayed"),
                Err(RelayError::Closed) => return ListenerExit::RelayClosed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelName;
    use crate::relay::RelayState;
    use std::time::Duration;
    use tokio::time::timeout;

    fn channel(name: &str) -> ChannelName {
        ChannelName::parse(name).unwrap()
    }

    async fn wait_for_listener(db: &MemoryPool, name: &str) {
        timeout(Duration::from_secs(2), async {
            while db.listener_count(name) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never subscribed");
    }

    fn start(
        db: &MemoryPool,
        relays: &RelayPool,
        name: &str,
        shutdown: &CancellationToken,
    ) -> (Arc<Relay>, tokio::task::JoinHandle<ListenerExit>) {
        let (relay, created) = relays.acquire(&channel(name));
        assert!(created);
        let listener = UpstreamListener::new(
            Arc::new(db.clone()),
            relays.clone(),
            relay.clone(),
            shutdown.clone(),
        );
        (relay, tokio::spawn(listener.run()))
    }

    #[tokio::test]
    async fn test_notifications_are_relayed() {
        let db = MemoryPool::new();
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, _task) = start(&db, &relays, "alerts", &shutdown);
        let mut sub = relay.subscribe().unwrap();

        wait_for_listener(&db, "alerts").await;
        db.notify("alerts", "A");
        db.notify("other", "not for us");
        db.notify("alerts", "B");

        assert_eq!(sub.recv().await.unwrap().payload, "A");
        assert_eq!(sub.recv().await.unwrap().payload, "B");
        assert_eq!(sub.channel().as_str(), "alerts");
    }

    #[tokio::test]
    async fn test_shutdown_releases_connection() {
        let db = MemoryPool::new();
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, task) = start(&db, &relays, "alerts", &shutdown);
        let _sub = relay.subscribe().unwrap();
        wait_for_listener(&db, "alerts").await;

        shutdown.cancel();
        let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert!(matches!(exit, ListenerExit::Shutdown));
        assert_eq!(relay.state(), RelayState::Closed);
        assert!(relays.is_empty());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_closes_relay() {
        let db = MemoryPool::new();
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, task) = start(&db, &relays, "alerts", &shutdown);
        let mut sub = relay.subscribe().unwrap();
        wait_for_listener(&db, "alerts").await;

        db.sever("alerts");

        let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(exit, ListenerExit::Failed(UpstreamError::ConnectionLost(_))));
        assert!(sub.recv().await.is_none());
        assert!(!relays.contains(&channel("alerts")));
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_acquire_failure_closes_relay() {
        let db = MemoryPool::new();
        db.fail_next_acquire();
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, task) = start(&db, &relays, "alerts", &shutdown);

        let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(exit, ListenerExit::Failed(UpstreamError::Acquire(_))));
        assert!(relay.is_closed());
        assert!(relays.is_empty());
    }

    #[tokio::test]
    async fn test_listen_failure_releases_connection() {
        let db = MemoryPool::new();
        db.fail_listen("alerts");
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, task) = start(&db, &relays, "alerts", &shutdown);

        let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(exit, ListenerExit::Failed(UpstreamError::Command { .. })));
        assert!(relay.is_closed());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_listener_stops_when_last_subscriber_leaves() {
        let db = MemoryPool::new();
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, task) = start(&db, &relays, "alerts", &shutdown);
        let sub = relay.subscribe().unwrap();
        wait_for_listener(&db, "alerts").await;

        drop(sub);

        let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(exit, ListenerExit::RelayClosed));
        assert_eq!(db.listener_count("alerts"), 0);
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_stalled_publish() {
        let db = MemoryPool::new();
        let relays = RelayPool::default();
        let shutdown = CancellationToken::new();
        let (relay, task) = start(&db, &relays, "alerts", &shutdown);
        // Never drained: the second notification stalls the listener
        let _stuck = relay.subscribe().unwrap();
        wait_for_listener(&db, "alerts").await;

        db.notify("alerts", "1");
        db.notify("alerts", "2");
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();
        let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(exit, ListenerExit::Shutdown));
        assert_eq!(db.open_connections(), 0);
    }
}
