//! pg_eventserv - PostgreSQL LISTEN/NOTIFY relayed to WebSocket clients
//!
//! Clients open a WebSocket on `/listen/<channel>` and receive the payload of
//! every `NOTIFY <channel>` as a text frame. Each channel with at least one
//! client is backed by exactly one dedicated `LISTEN` connection, shared by
//! all of that channel's clients and torn down when the last one leaves.

pub mod channels;
pub mod config;
pub mod hub;
pub mod relay;
pub mod server;
pub mod session;
pub mod upstream;

pub use channels::{AllowList, ChannelAuthorizer, ChannelName, ChannelPattern};
pub use config::{ConfigError, DeliveryMode, Settings};
pub use hub::{EventHub, HubConfig};
pub use relay::{DeliveryPolicy, Notification, Relay, RelayPool, Subscription};
pub use server::{EventServer, EventServerConfig};
pub use session::{ClientSession, Frame, FrameSink, PeerEvents, SessionConfig, SessionEnd, SessionError};
pub use upstream::{ConnectionPool, MemoryPool, PgConnectionPool, PostgresConfig, UpstreamListener};
