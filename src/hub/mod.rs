//! The relay core as seen by the connection-accepting layer
//!
//! [`EventHub`] owns the relay pool and every task spawned on its behalf.
//! Accepting code calls [`EventHub::open_session`] once per client connection;
//! the hub starts at most one upstream listener per channel and tears
//! everything down on [`EventHub::shutdown`].

use crate::channels::{ChannelAuthorizer, ChannelName};
use crate::relay::{DeliveryPolicy, Relay, RelayError, RelayPool, Subscription};
use crate::session::{ClientSession, FrameSink, PeerEvents, SessionConfig, SessionEnd, SessionError};
use crate::upstream::{ConnectionPool, UpstreamListener};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Hub configuration
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub session: SessionConfig,
    pub delivery: DeliveryPolicy,
    /// How long shutdown waits for sessions and listeners to finish
    pub shutdown_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            delivery: DeliveryPolicy::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub struct EventHub {
    config: HubConfig,
    relays: RelayPool,
    db: Arc<dyn ConnectionPool>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl EventHub {
    pub fn new(
        config: HubConfig,
        db: Arc<dyn ConnectionPool>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            relays: RelayPool::new(config.delivery),
            config,
            db,
            authorizer,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn relays(&self) -> &RelayPool {
        &self.relays
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Validate a requested channel against the allow-list
    pub fn authorize(&self, channel: &str) -> Result<ChannelName, SessionError> {
        if !self.authorizer.is_allowed(channel) {
            return Err(SessionError::Forbidden(channel.to_string()));
        }
        Ok(ChannelName::parse(channel)?)
    }

    /// Attach a new subscriber to `channel`, starting its listener if needed
    pub fn attach(&self, channel: &ChannelName) -> Result<Subscription, SessionError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(SessionError::ShuttingDown);
            }
            let (relay, created) = self.relays.acquire(channel);
            if created {
                self.spawn_listener(relay.clone());
            }
            match relay.subscribe() {
                Ok(subscription) => return Ok(subscription),
                // Lost the race against the last subscriber leaving; the
                // next acquire sees an empty slot and creates a fresh relay
                Err(RelayError::Closed) => {
                    debug!(channel = %channel, "relay closed before subscribe, retrying");
                }
            }
        }
    }

    fn spawn_listener(&self, relay: Arc<Relay>) {
        let listener = UpstreamListener::new(
            self.db.clone(),
            self.relays.clone(),
            relay,
            self.shutdown.clone(),
        );
        self.tasks.spawn(listener.run());
    }

    /// Serve one client connection on `channel` until the session ends
    ///
    /// Fails immediately with [`SessionError::Forbidden`] for a disallowed
    /// channel, without touching the relay pool. A write failure is reported
    /// as [`SessionError::Delivery`]; every other ending is `Ok`.
    pub async fn open_session<S, P>(&self, sink: S, peer: P, channel: &str) -> Result<SessionEnd, SessionError>
    where
        S: FrameSink,
        P: PeerEvents,
    {
        let channel = self.authorize(channel)?;
        let subscription = self.attach(&channel)?;
        let session = ClientSession::new(
            sink,
            peer,
            subscription,
            self.shutdown.child_token(),
            self.config.session,
        );
        info!(session_id = %session.id(), channel = %channel, "session opened");

        match session.run().await {
            SessionEnd::WriteFailed(e) => Err(SessionError::Delivery(e)),
            end => Ok(end),
        }
    }

    /// Count `future` among the tasks shutdown waits for
    pub fn track<F: Future>(&self, future: F) -> TrackedFuture<F> {
        self.tasks.track_future(future)
    }

    /// Live channels and their subscriber counts
    pub fn channels(&self) -> Vec<(ChannelName, usize)> {
        self.relays.channels()
    }

    /// Tracked sessions and listeners still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Fire the shutdown signal and wait for every tracked task
    ///
    /// Returns `false` if tasks were still running when the grace period ran
    /// out. Safe to call more than once.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.cancel();
        let closed = self.relays.close_all();
        self.tasks.close();
        info!(relays = closed, tasks = self.tasks.len(), "shutting down relays and sessions");

        match tokio::time::timeout(self.config.shutdown_grace, self.tasks.wait()).await {
            Ok(()) => {
                info!("all sessions and listeners stopped");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tasks.len(),
                    grace = ?self.config.shutdown_grace,
                    "shutdown grace period expired"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AllowList;
    use crate::session::{Frame, TransportError};
    use crate::upstream::MemoryPool;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&mut self, _frame: Frame) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct NeverLeaves;

    #[async_trait]
    impl PeerEvents for NeverLeaves {
        async fn disconnected(&mut self) {
            std::future::pending::<()>().await
        }
    }

    fn hub(db: &MemoryPool, patterns: &[&str]) -> EventHub {
        EventHub::new(
            HubConfig::default(),
            Arc::new(db.clone()),
            Arc::new(AllowList::new(patterns).unwrap()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_forbidden_channel_never_reaches_pool() {
        let db = MemoryPool::new();
        let hub = hub(&db, &["public_*"]);

        let result = hub.open_session(NullSink, NeverLeaves, "secret").await;
        assert!(matches!(result, Err(SessionError::Forbidden(name)) if name == "secret"));
        assert!(hub.relays().is_empty());
        assert_eq!(hub.active_tasks(), 0);
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let db = MemoryPool::new();
        let hub = hub(&db, &["*"]);
        assert!(matches!(hub.authorize(""), Err(SessionError::InvalidChannel(_))));
    }

    #[tokio::test]
    async fn test_attach_spawns_one_listener() {
        let db = MemoryPool::new();
        let hub = hub(&db, &["*"]);
        let channel = ChannelName::parse("alerts").unwrap();

        let a = hub.attach(&channel).unwrap();
        let b = hub.attach(&channel).unwrap();
        assert_eq!(hub.active_tasks(), 1);
        assert_eq!(hub.channels(), vec![(channel.clone(), 2)]);

        drop(a);
        drop(b);
        assert!(hub.relays().is_empty());
    }

    #[tokio::test]
    async fn test_attach_after_shutdown_refused() {
        let db = MemoryPool::new();
        let hub = hub(&db, &["*"]);
        assert!(hub.shutdown().await);
        assert!(hub.shutdown().await);

        let channel = ChannelName::parse("alerts").unwrap();
        assert!(matches!(hub.attach(&channel), Err(SessionError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_session() {
        let db = MemoryPool::new();
        let hub = Arc::new(hub(&db, &["*"]));

        let session = {
            let hub = hub.clone();
            tokio::spawn(hub.clone().track(async move {
                hub.open_session(NullSink, NeverLeaves, "alerts").await
            }))
        };
        while hub.relays().is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(hub.shutdown().await);
        let end = session.await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::Shutdown | SessionEnd::RelayClosed));
        assert_eq!(db.open_connections(), 0);
    }
}
