//! Per-channel broadcast relays
//!
//! A [`Relay`] fans every notification of one channel out to the mailboxes of
//! its subscribers. Relays are normally created through the [`RelayPool`],
//! which removes a relay as soon as its last subscriber detaches.

mod pool;

pub use pool::RelayPool;

use crate::channels::ChannelName;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use self::pool::PoolShared;

/// A notification received from the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: ChannelName,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: ChannelName, payload: impl Into<String>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay is closed")]
    Closed,
}

/// How a relay hands notifications to subscriber mailboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Publishing waits for a free slot in every mailbox. One slow subscriber
    /// holds up the whole channel, but nothing is dropped.
    Blocking(usize),
    /// Publishing never waits. A subscriber that falls behind loses its oldest
    /// pending notifications and keeps at most `depth` of them.
    DropOldest(usize),
}

impl DeliveryPolicy {
    pub fn depth(&self) -> usize {
        match self {
            Self::Blocking(depth) | Self::DropOldest(depth) => (*depth).max(1),
        }
    }

    fn mailbox(&self) -> (MailboxSender, MailboxReceiver) {
        match self {
            Self::Blocking(_) => {
                let (tx, rx) = mpsc::channel(self.depth());
                (MailboxSender::Blocking(tx), MailboxReceiver::Blocking(rx))
            }
            Self::DropOldest(_) => {
                // broadcast rounds its capacity up to a power of two; the
                // receiver trims the surplus
                let (tx, rx) = broadcast::channel(self.depth());
                let receiver = MailboxReceiver::DropOldest {
                    rx,
                    depth: self.depth(),
                };
                (MailboxSender::DropOldest(tx), receiver)
            }
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::Blocking(1)
    }
}

#[derive(Clone)]
enum MailboxSender {
    Blocking(mpsc::Sender<Notification>),
    DropOldest(broadcast::Sender<Notification>),
}

enum MailboxReceiver {
    Blocking(mpsc::Receiver<Notification>),
    DropOldest {
        rx: broadcast::Receiver<Notification>,
        depth: usize,
    },
}

/// Identifies one mailbox within a relay
pub type SubscriberId = u64;

/// Observable lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No mailboxes attached yet (or all detached on a pool-less relay)
    Empty,
    Active,
    /// Terminal
    Closed,
}

struct Registry {
    mailboxes: HashMap<SubscriberId, MailboxSender>,
    next_id: SubscriberId,
    closed: bool,
}

/// Fan-out hub for a single channel
pub struct Relay {
    channel: ChannelName,
    policy: DeliveryPolicy,
    registry: Mutex<Registry>,
    closed: CancellationToken,
    pool: Weak<PoolShared>,
}

impl Relay {
    /// Create a relay that is not managed by any pool
    pub fn new(channel: ChannelName, policy: DeliveryPolicy) -> Self {
        Self::with_pool(channel, policy, Weak::new())
    }

    pub(crate) fn with_pool(channel: ChannelName, policy: DeliveryPolicy, pool: Weak<PoolShared>) -> Self {
        Self {
            channel,
            policy,
            registry: Mutex::new(Registry {
                mailboxes: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
            closed: CancellationToken::new(),
            pool,
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Register a new mailbox
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription, RelayError> {
        let (tx, rx) = self.policy.mailbox();
        let id = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return Err(RelayError::Closed);
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.mailboxes.insert(id, tx);
            id
        };
        trace!(channel = %self.channel, subscriber = id, "mailbox attached");

        Ok(Subscription {
            id,
            relay: self.clone(),
            mailbox: rx,
            attached: true,
        })
    }

    /// Deliver a notification to every registered mailbox
    ///
    /// Returns the number of mailboxes that accepted it. Under the blocking
    /// policy this waits for each full mailbox to drain, and fails with
    /// [`RelayError::Closed`] if the relay is closed meanwhile.
    pub async fn publish(&self, notification: Notification) -> Result<usize, RelayError> {
        let targets: Vec<(SubscriberId, MailboxSender)> = {
            let registry = self.registry.lock();
            if registry.closed {
                return Err(RelayError::Closed);
            }
            registry
                .mailboxes
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            let accepted = match tx {
                MailboxSender::Blocking(tx) => {
                    tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => return Err(RelayError::Closed),
                        sent = tx.send(notification.clone()) => sent.is_ok(),
                    }
                }
                MailboxSender::DropOldest(tx) => tx.send(notification.clone()).is_ok(),
            };
            if accepted {
                delivered += 1;
            } else {
                trace!(channel = %self.channel, subscriber = id, "mailbox gone before delivery");
            }
        }
        Ok(delivered)
    }

    /// Remove a mailbox
    ///
    /// On a pooled relay this also releases the relay back to its pool, which
    /// closes it when no subscribers remain.
    pub fn unsubscribe(&self, id: SubscriberId) {
        match self.pool.upgrade() {
            Some(pool) => pool.detach(self, id),
            None => {
                self.remove_mailbox(id);
            }
        }
    }

    /// Drop the mailbox and return how many remain
    pub(crate) fn remove_mailbox(&self, id: SubscriberId) -> usize {
        let mut registry = self.registry.lock();
        if registry.mailboxes.remove(&id).is_some() {
            trace!(channel = %self.channel, subscriber = id, "mailbox detached");
        }
        registry.mailboxes.len()
    }

    /// Invalidate every mailbox and unblock pending publishers. Idempotent.
    pub fn close(&self) {
        let dropped = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.mailboxes)
        };
        self.closed.cancel();
        debug!(channel = %self.channel, subscribers = dropped.len(), "relay closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the relay is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().mailboxes.len()
    }

    pub fn state(&self) -> RelayState {
        let registry = self.registry.lock();
        if registry.closed {
            RelayState::Closed
        } else if registry.mailboxes.is_empty() {
            RelayState::Empty
        } else {
            RelayState::Active
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("channel", &self.channel)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}

/// A subscriber's handle on its mailbox
///
/// Dropping the handle unsubscribes it.
pub struct Subscription {
    id: SubscriberId,
    relay: Arc<Relay>,
    mailbox: MailboxReceiver,
    attached: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> &ChannelName {
        self.relay.channel()
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Wait for the next notification; `None` once the relay is closed
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match &mut self.mailbox {
                MailboxReceiver::Blocking(rx) => {
                    return tokio::select! {
                        biased;
                        _ = self.relay.closed() => None,
                        next = rx.recv() => next,
                    };
                }
                MailboxReceiver::DropOldest { rx, depth } => {
                    let skipped = trim_backlog(rx, *depth);
                    if skipped > 0 {
                        debug!(
                            channel = %self.relay.channel(),
                            subscriber = self.id,
                            skipped,
                            "slow subscriber dropped notifications"
                        );
                    }

                    let next = tokio::select! {
                        biased;
                        _ = self.relay.closed() => return None,
                        next = rx.recv() => next,
                    };
                    match next {
                        Ok(notification) => return Some(notification),
                        // Overran the ring while waiting; trim again
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        }
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::replace(&mut self.attached, false) {
            self.relay.unsubscribe(self.id);
        }
    }
}

/// Discard the oldest pending notifications until at most `depth` remain
fn trim_backlog(rx: &mut broadcast::Receiver<Notification>, depth: usize) -> u64 {
    let mut skipped = 0;
    while rx.len() > depth {
        match rx.try_recv() {
            Ok(_) => skipped += 1,
            Err(broadcast::error::TryRecvError::Lagged(lost)) => skipped += lost,
            Err(_) => break,
        }
    }
    skipped
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", self.relay.channel())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn relay(policy: DeliveryPolicy) -> Arc<Relay> {
        Arc::new(Relay::new(ChannelName::parse("alerts").unwrap(), policy))
    }

    fn note(relay: &Relay, payload: &str) -> Notification {
        Notification::new(relay.channel().clone(), payload)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let relay = relay(DeliveryPolicy::Blocking(1));
        let mut subs: Vec<_> = (0..5).map(|_| relay.subscribe().unwrap()).collect();

        let delivered = relay.publish(note(&relay, "A")).await.unwrap();
        assert_eq!(delivered, 5);

        for sub in subs.iter_mut() {
            assert_eq!(sub.recv().await.unwrap().payload, "A");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let relay = relay(DeliveryPolicy::default());
        assert_eq!(relay.state(), RelayState::Empty);
        assert_eq!(relay.publish(note(&relay, "nobody")).await, Ok(0));
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscriber() {
        let relay = relay(DeliveryPolicy::Blocking(1));
        let mut sub = relay.subscribe().unwrap();

        let publisher = {
            let relay = relay.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    relay.publish(note(&relay, &i.to_string())).await.unwrap();
                }
            })
        };

        for i in 0..20 {
            assert_eq!(sub.recv().await.unwrap().payload, i.to_string());
        }
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_policy_waits_for_full_mailbox() {
        let relay = relay(DeliveryPolicy::Blocking(1));
        let mut sub = relay.subscribe().unwrap();

        relay.publish(note(&relay, "first")).await.unwrap();

        // Mailbox holds one notification; the second publish must wait
        let second = relay.publish(note(&relay, "second"));
        tokio::pin!(second);
        assert!(timeout(Duration::from_millis(50), &mut second).await.is_err());

        assert_eq!(sub.recv().await.unwrap().payload, "first");
        assert_eq!(second.await, Ok(1));
        assert_eq!(sub.recv().await.unwrap().payload, "second");
    }

    #[tokio::test]
    async fn test_close_unblocks_stalled_publisher() {
        let relay = relay(DeliveryPolicy::Blocking(1));
        let _sub = relay.subscribe().unwrap();
        relay.publish(note(&relay, "fill")).await.unwrap();

        let stalled = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.publish(note(&relay, "stuck")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.close();

        let result = timeout(Duration::from_secs(1), stalled).await.unwrap().unwrap();
        assert_eq!(result, Err(RelayError::Closed));
    }

    #[tokio::test]
    async fn test_dropping_slow_subscriber_unblocks_publisher() {
        let relay = relay(DeliveryPolicy::Blocking(1));
        let slow = relay.subscribe().unwrap();
        let mut fast = relay.subscribe().unwrap();

        relay.publish(note(&relay, "1")).await.unwrap();
        assert_eq!(fast.recv().await.unwrap().payload, "1");

        let pending = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.publish(note(&relay, "2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(slow);

        assert_eq!(fast.recv().await.unwrap().payload, "2");
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_drop_oldest_never_blocks() {
        let relay = relay(DeliveryPolicy::DropOldest(2));
        let mut sub = relay.subscribe().unwrap();

        for i in 0..5 {
            let published = timeout(Duration::from_millis(50), relay.publish(note(&relay, &i.to_string())))
                .await
                .expect("drop-oldest publish must not block");
            assert_eq!(published, Ok(1));
        }

        // Only the two newest survive
        assert_eq!(sub.recv().await.unwrap().payload, "3");
        assert_eq!(sub.recv().await.unwrap().payload, "4");
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_exact_depth() {
        // 3 is not a power of two; the ring must still hold exactly three
        let relay = relay(DeliveryPolicy::DropOldest(3));
        let mut sub = relay.subscribe().unwrap();

        for i in 0..=5 {
            relay.publish(note(&relay, &i.to_string())).await.unwrap();
        }

        assert_eq!(sub.recv().await.unwrap().payload, "3");
        assert_eq!(sub.recv().await.unwrap().payload, "4");
        assert_eq!(sub.recv().await.unwrap().payload, "5");

        // Below the depth nothing is dropped
        relay.publish(note(&relay, "6")).await.unwrap();
        relay.publish(note(&relay, "7")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().payload, "6");
        assert_eq!(sub.recv().await.unwrap().payload, "7");
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let relay = relay(DeliveryPolicy::default());
        let mut sub = relay.subscribe().unwrap();
        assert_eq!(relay.state(), RelayState::Active);

        relay.close();
        relay.close();

        assert_eq!(relay.state(), RelayState::Closed);
        assert!(relay.is_closed());
        assert!(sub.recv().await.is_none());
        assert_eq!(relay.subscribe().unwrap_err(), RelayError::Closed);
        assert_eq!(relay.publish(note(&relay, "late")).await, Err(RelayError::Closed));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_mailbox() {
        let relay = relay(DeliveryPolicy::default());
        let a = relay.subscribe().unwrap();
        let b = relay.subscribe().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(relay.subscriber_count(), 2);

        a.unsubscribe();
        assert_eq!(relay.subscriber_count(), 1);
        drop(b);
        assert_eq!(relay.subscriber_count(), 0);
        // A relay outside any pool stays open when emptied
        assert_eq!(relay.state(), RelayState::Empty);
    }

    #[test]
    fn test_policy_depth_is_at_least_one() {
        assert_eq!(DeliveryPolicy::Blocking(0).depth(), 1);
        assert_eq!(DeliveryPolicy::DropOldest(8).depth(), 8);
        assert_eq!(DeliveryPolicy::default(), DeliveryPolicy::Blocking(1));
    }
}
