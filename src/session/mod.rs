//! Client sessions
//!
//! A [`ClientSession`] ties one client connection to one relay subscription.
//! It forwards every notification as a text frame and pings the client on a
//! fixed interval; both loops share the connection through a single write
//! lock. The session ends when the peer goes away, a write fails, the relay
//! closes, or the process shuts down.

use crate::channels::{ChannelError, ChannelName};
use crate::relay::Subscription;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A notification payload
    Text(String),
    /// Protocol-level liveness probe
    Ping,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("requested channel '{0}' is not allowed")]
    Forbidden(String),

    #[error("invalid channel name: {0}")]
    InvalidChannel(#[from] ChannelError),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("delivery failed: {0}")]
    Delivery(TransportError),
}

/// Write half of a client connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a client connection
#[async_trait]
pub trait PeerEvents: Send {
    /// Resolves once the peer has closed the connection or it has failed
    async fn disconnected(&mut self);
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    /// The channel's relay closed (upstream failure or teardown)
    RelayClosed,
    Shutdown,
    WriteFailed(TransportError),
}

/// Session timing
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    /// Upper bound on a single frame write
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ClientSession<S, P> {
    id: Uuid,
    channel: ChannelName,
    sink: S,
    peer: P,
    subscription: Subscription,
    cancel: CancellationToken,
    config: SessionConfig,
}

impl<S: FrameSink, P: PeerEvents> ClientSession<S, P> {
    /// `cancel` should be a child of the process shutdown token
    pub fn new(
        sink: S,
        peer: P,
        subscription: Subscription,
        cancel: CancellationToken,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: subscription.channel().clone(),
            sink,
            peer,
            subscription,
            cancel,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session to completion and tear it down
    ///
    /// Both inner loops have finished and the subscription is gone by the
    /// time this returns.
    pub async fn run(self) -> SessionEnd {
        let Self {
            id,
            channel,
            sink,
            mut peer,
            mut subscription,
            cancel,
            config,
        } = self;
        debug!(session_id = %id, channel = %channel, "session started");

        let writer = Mutex::new(sink);
        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => SessionEnd::Shutdown,
            _ = peer.disconnected() => SessionEnd::PeerClosed,
            end = forward(id, &writer, &mut subscription, config.write_timeout) => end,
            end = keepalive(id, &writer, config) => end,
        };

        cancel.cancel();
        subscription.unsubscribe();

        let mut sink = writer.into_inner();
        match tokio::time::timeout(config.write_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(session_id = %id, error = %e, "close frame not sent"),
            Err(_) => trace!(session_id = %id, "close frame timed out"),
        }

        match &end {
            SessionEnd::WriteFailed(e) => {
                info!(session_id = %id, channel = %channel, error = %e, "closing session after write failure")
            }
            other => debug!(session_id = %id, channel = %channel, reason = ?other, "session ended"),
        }
        end
    }
}

async fn write<S: FrameSink>(writer: &Mutex<S>, frame: Frame, limit: Duration) -> Result<(), TransportError> {
    let mut sink = writer.lock().await;
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

async fn forward<S: FrameSink>(
    id: Uuid,
    writer: &Mutex<S>,
    subscription: &mut Subscription,
    limit: Duration,
) -> SessionEnd {
    while let Some(notification) = subscription.recv().await {
        trace!(session_id = %id, payload = %notification.payload, "sending notification");
        if let Err(e) = write(writer, Frame::Text(notification.payload), limit).await {
            return SessionEnd::WriteFailed(e);
        }
    }
    SessionEnd::RelayClosed
}

async fn keepalive<S: FrameSink>(id: Uuid, writer: &Mutex<S>, config: SessionConfig) -> SessionEnd {
    let mut ticker = tokio::time::interval(config.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = write(writer, Frame::Ping, config.write_timeout).await {
            trace!(session_id = %id, error = %e, "keepalive failed");
            return SessionEnd::WriteFailed(e);
        }
    }
}
