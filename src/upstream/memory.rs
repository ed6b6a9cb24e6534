//! In-process notification bus
//!
//! Behaves like a database that supports `LISTEN`: connections subscribe to
//! channels with `LISTEN "name"` and receive whatever [`MemoryPool::notify`]
//! sends. Used by the test suites and for running without a database.

use super::{Connection, ConnectionPool, RawNotification, UpstreamError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Delivery = Result<RawNotification, UpstreamError>;

#[derive(Default)]
struct Bus {
    /// connection id -> sender for that connection
    connections: HashMap<u64, mpsc::UnboundedSender<Delivery>>,
    /// channel -> connection ids listening to it
    listening: HashMap<String, HashSet<u64>>,
    failing_listens: HashSet<String>,
}

#[derive(Default)]
struct Shared {
    bus: Mutex<Bus>,
    next_id: AtomicU64,
    fail_next_acquire: AtomicBool,
}

/// Shared handle; clones talk to the same bus
#[derive(Clone, Default)]
pub struct MemoryPool {
    shared: Arc<Shared>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a notification to every connection listening on `channel`
    pub fn notify(&self, channel: &str, payload: &str) -> usize {
        let bus = self.shared.bus.lock();
        let Some(ids) = bus.listening.get(channel) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| bus.connections.get(id))
            .filter(|tx| {
                tx.send(Ok(RawNotification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                }))
                .is_ok()
            })
            .count()
    }

    /// Break every connection listening on `channel`
    pub fn sever(&self, channel: &str) -> usize {
        let bus = self.shared.bus.lock();
        let Some(ids) = bus.listening.get(channel) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| bus.connections.get(id))
            .filter(|tx| {
                tx.send(Err(UpstreamError::ConnectionLost("connection reset".to_string())))
                    .is_ok()
            })
            .count()
    }

    /// Make the next `acquire_dedicated` fail
    pub fn fail_next_acquire(&self) {
        self.shared.fail_next_acquire.store(true, Ordering::SeqCst);
    }

    /// Make `LISTEN` on `channel` fail until further notice
    pub fn fail_listen(&self, channel: &str) {
        self.shared.bus.lock().failing_listens.insert(channel.to_string());
    }

    /// Number of connections currently listening on `channel`
    pub fn listener_count(&self, channel: &str) -> usize {
        self.shared
            .bus
            .lock()
            .listening
            .get(channel)
            .map_or(0, HashSet::len)
    }

    /// Connections handed out and not yet released
    pub fn open_connections(&self) -> usize {
        self.shared.bus.lock().connections.len()
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn acquire_dedicated(&self) -> Result<Box<dyn Connection>, UpstreamError> {
        if self.shared.fail_next_acquire.swap(false, Ordering::SeqCst) {
            return Err(UpstreamError::Acquire("connection refused".to_string()));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.bus.lock().connections.insert(id, tx);
        Ok(Box::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
            inbox: rx,
            released: false,
        }))
    }
}

/// A connection handed out by [`MemoryPool`]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedReceiver<Delivery>,
    released: bool,
}

impl MemoryConnection {
    fn detach(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let mut bus = self.shared.bus.lock();
        bus.connections.remove(&self.id);
        bus.listening.retain(|_, ids| {
            ids.remove(&self.id);
            !ids.is_empty()
        });
    }
}

/// Undo the identifier quoting applied by `ChannelName::quoted`
fn unquote(identifier: &str) -> String {
    match identifier
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => identifier.to_string(),
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, command: &str) -> Result<(), UpstreamError> {
        if self.released {
            return Err(UpstreamError::ConnectionLost("connection released".to_string()));
        }
        let Some(target) = command.strip_prefix("LISTEN ") else {
            return Ok(());
        };
        let channel = unquote(target.trim());

        let mut bus = self.shared.bus.lock();
        if bus.failing_listens.contains(&channel) {
            return Err(UpstreamError::Command {
                command: command.to_string(),
                message: "permission denied".to_string(),
            });
        }
        bus.listening.entry(channel).or_default().insert(self.id);
        Ok(())
    }

    async fn wait_for_notification(&mut self) -> Result<RawNotification, UpstreamError> {
        match self.inbox.recv().await {
            Some(delivery) => delivery,
            None => Err(UpstreamError::ConnectionLost("connection closed".to_string())),
        }
    }

    async fn release(&mut self) {
        self.detach();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.detach();
    }
}
