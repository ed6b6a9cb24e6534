//! Shared harness: an in-memory database and channel-backed client connections

#![allow(dead_code)]

use async_trait::async_trait;
use pg_eventserv::channels::AllowList;
use pg_eventserv::hub::{EventHub, HubConfig};
use pg_eventserv::session::{Frame, FrameSink, PeerEvents, SessionEnd, SessionError, TransportError};
use pg_eventserv::upstream::MemoryPool;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn hub(db: &MemoryPool, patterns: &[&str], config: HubConfig) -> Arc<EventHub> {
    Arc::new(EventHub::new(
        config,
        Arc::new(db.clone()),
        Arc::new(AllowList::new(patterns).unwrap()),
        CancellationToken::new(),
    ))
}

/// How the fake connection behaves when written to
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    Healthy,
    /// Text frames fail, pings succeed
    FailText,
    /// Pings fail, text frames succeed
    FailPing,
    /// Every write and the close never complete
    Stalled,
}

pub struct TestSink {
    frames: mpsc::UnboundedSender<Frame>,
    mode: SinkMode,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for TestSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match (self.mode, &frame) {
            (SinkMode::Stalled, _) => std::future::pending().await,
            (SinkMode::FailText, Frame::Text(_)) | (SinkMode::FailPing, Frame::Ping) => {
                Err(TransportError::Io("broken pipe".to_string()))
            }
            _ => self.frames.send(frame).map_err(|_| TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.mode == SinkMode::Stalled {
            std::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestPeer(CancellationToken);

#[async_trait]
impl PeerEvents for TestPeer {
    async fn disconnected(&mut self) {
        self.0.cancelled().await
    }
}

/// One simulated client connection driven through [`EventHub::open_session`]
pub struct TestClient {
    frames: mpsc::UnboundedReceiver<Frame>,
    hangup: CancellationToken,
    closed: Arc<AtomicBool>,
    task: JoinHandle<Result<SessionEnd, SessionError>>,
}

impl TestClient {
    pub fn connect(hub: &Arc<EventHub>, channel: &str) -> Self {
        Self::connect_with(hub, channel, SinkMode::Healthy)
    }

    pub fn connect_with(hub: &Arc<EventHub>, channel: &str, mode: SinkMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let hangup = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));
        let sink = TestSink {
            frames: tx,
            mode,
            closed: closed.clone(),
        };
        let peer = TestPeer(hangup.clone());

        let session_hub = hub.clone();
        let channel = channel.to_string();
        let task = tokio::spawn(hub.track(async move {
            session_hub.open_session(sink, peer, &channel).await
        }));

        Self {
            frames: rx,
            hangup,
            closed,
            task,
        }
    }

    /// Next notification payload, skipping keepalive pings
    pub async fn next_text(&mut self) -> Option<String> {
        timeout(TIMEOUT, async {
            loop {
                match self.frames.recv().await? {
                    Frame::Text(text) => return Some(text),
                    Frame::Ping => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for a notification")
    }

    /// Wait for the next ping
    pub async fn next_ping(&mut self) {
        timeout(TIMEOUT, async {
            loop {
                match self.frames.recv().await {
                    Some(Frame::Ping) => return,
                    Some(Frame::Text(_)) => continue,
                    None => panic!("session ended before a ping"),
                }
            }
        })
        .await
        .expect("timed out waiting for a ping")
    }

    /// Payloads already delivered, without waiting
    pub fn drain_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let Frame::Text(text) = frame {
                texts.push(text);
            }
        }
        texts
    }

    pub fn hang_up(&self) {
        self.hangup.cancel();
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end
    pub async fn finish(self) -> Result<SessionEnd, SessionError> {
        timeout(TIMEOUT, self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }

    /// Hang up and wait for the session to end
    pub async fn disconnect(self) -> Result<SessionEnd, SessionError> {
        self.hang_up();
        self.finish().await
    }
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting until {what}");
}

/// Wait for a database listener on `channel`
pub async fn wait_for_listener(db: &MemoryPool, channel: &str) {
    wait_until(&format!("a listener on {channel}"), || db.listener_count(channel) > 0).await;
}

/// Wait until `channel` has exactly `count` subscribers in the hub
pub async fn wait_for_subscribers(hub: &EventHub, channel: &str, count: usize) {
    wait_until(&format!("{count} subscribers on {channel}"), || {
        subscribers(hub, channel) == count
    })
    .await;
}

pub fn subscribers(hub: &EventHub, channel: &str) -> usize {
    hub.channels()
        .into_iter()
        .find(|(name, _)| name.as_str() == channel)
        .map_or(0, |(_, count)| count)
}

/// Run `future` to completion, failing the test if it takes longer than `limit`
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    timeout(limit, future).await.expect("operation overran its deadline")
}
