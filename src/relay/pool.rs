//! Channel name -> relay registry

use super::{DeliveryPolicy, Relay, SubscriberId};
use crate::channels::ChannelName;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PoolShared {
    relays: Mutex<HashMap<ChannelName, Arc<Relay>>>,
    policy: DeliveryPolicy,
}

impl PoolShared {
    /// Remove a mailbox and, if it was the last one, retire the relay.
    ///
    /// Runs under the pool lock so that it cannot interleave with an
    /// `acquire` of the same channel.
    pub(crate) fn detach(&self, relay: &Relay, id: SubscriberId) {
        let mut relays = self.relays.lock();
        if relay.remove_mailbox(id) == 0 {
            Self::retire(&mut relays, relay);
        }
    }

    /// Close the relay and drop its entry if the entry still points at it
    fn retire(relays: &mut HashMap<ChannelName, Arc<Relay>>, relay: &Relay) -> bool {
        relay.close();
        let current = relays
            .get(relay.channel())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), relay));
        if current {
            relays.remove(relay.channel());
            debug!(channel = %relay.channel(), "relay removed from pool");
        }
        current
    }
}

/// Process-wide set of live relays, one per channel
///
/// The pool decides which caller starts the upstream listener for a channel:
/// [`RelayPool::acquire`] reports `true` to exactly one caller per relay.
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl RelayPool {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                relays: Mutex::new(HashMap::new()),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.shared.policy
    }

    /// Get the relay for `channel`, creating it if needed
    ///
    /// The flag is `true` when this call created the relay.
    pub fn acquire(&self, channel: &ChannelName) -> (Arc<Relay>, bool) {
        let mut relays = self.shared.relays.lock();
        if let Some(relay) = relays.get(channel) {
            if !relay.is_closed() {
                return (relay.clone(), false);
            }
        }

        let relay = Arc::new(Relay::with_pool(
            channel.clone(),
            self.shared.policy,
            Arc::downgrade(&self.shared),
        ));
        relays.insert(channel.clone(), relay.clone());
        debug!(channel = %channel, "relay created");
        (relay, true)
    }

    /// Retire `relay` if it has no subscribers left
    ///
    /// Returns `true` if the relay was closed by this call.
    pub fn release(&self, relay: &Relay) -> bool {
        let mut relays = self.shared.relays.lock();
        if relay.is_closed() || relay.subscriber_count() > 0 {
            return false;
        }
        PoolShared::retire(&mut relays, relay);
        true
    }

    /// Close `relay` and remove it from the pool regardless of subscribers
    ///
    /// Used when the upstream side of a channel goes away. A relay that was
    /// already replaced in the pool leaves the newer entry untouched.
    pub fn evict(&self, relay: &Relay) -> bool {
        let mut relays = self.shared.relays.lock();
        PoolShared::retire(&mut relays, relay)
    }

    /// Close every relay and empty the pool. Idempotent.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Relay>> = {
            let mut relays = self.shared.relays.lock();
            relays.drain().map(|(_, relay)| relay).collect()
        };
        for relay in &drained {
            relay.close();
        }
        drained.len()
    }

    pub fn get(&self, channel: &ChannelName) -> Option<Arc<Relay>> {
        self.shared.relays.lock().get(channel).cloned()
    }

    pub fn contains(&self, channel: &ChannelName) -> bool {
        self.shared.relays.lock().contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.shared.relays.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live channel and its subscriber count, sorted by name
    pub fn channels(&self) -> Vec<(ChannelName, usize)> {
        let relays: Vec<Arc<Relay>> = self.shared.relays.lock().values().cloned().collect();
        let mut channels: Vec<_> = relays
            .iter()
            .map(|relay| (relay.channel().clone(), relay.subscriber_count()))
            .collect();
        channels.sort();
        channels
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(DeliveryPolicy::default())
    }
}
