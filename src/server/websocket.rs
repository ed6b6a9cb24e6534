//! WebSocket endpoint and HTTP routes

use crate::hub::EventHub;
use crate::server::urls::{normalize_base_path, server_ws_base};
use crate::session::{Frame, FrameSink, PeerEvents, SessionError, TransportError};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<EventHub>,
    pub base_path: String,
    pub url_base: Option<String>,
    /// Allow-list patterns, for display only
    pub allowed: Vec<String>,
}

/// Create the HTTP router, mounted under the configured base path
pub fn create_router(state: WsState) -> Router {
    let base_path = normalize_base_path(&state.base_path);
    let routes = Router::new()
        .route("/", get(index_handler))
        .route("/index.html", get(index_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/listen/{channel}", get(listen_handler))
        .with_state(state);

    if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&base_path, routes)
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ChannelStatus {
    channel: String,
    subscribers: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    channels: Vec<ChannelStatus>,
    allowed: Vec<String>,
    tasks: usize,
}

async fn status_handler(State(state): State<WsState>) -> Json<StatusResponse> {
    let channels = state
        .hub
        .channels()
        .into_iter()
        .map(|(channel, subscribers)| ChannelStatus {
            channel: channel.to_string(),
            subscribers,
        })
        .collect();

    Json(StatusResponse {
        channels,
        allowed: state.allowed.clone(),
        tasks: state.hub.active_tasks(),
    })
}

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>pg_eventserv</title></head>
<body>
<h1>pg_eventserv</h1>
<p>Open a WebSocket to <code>{{BASE_URL}}/listen/&lt;channel&gt;</code> to receive
notifications sent with <code>NOTIFY &lt;channel&gt;, 'payload'</code>.</p>
<p>Allowed channels: <code>{{CHANNELS}}</code></p>
</body>
</html>
"#;

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn index_handler(State(state): State<WsState>, headers: HeaderMap) -> Html<String> {
    let base = server_ws_base(&headers, state.url_base.as_deref(), &state.base_path);
    Html(
        INDEX_TEMPLATE
            .replace("{{BASE_URL}}", &escape_html(&base))
            .replace("{{CHANNELS}}", &escape_html(&state.allowed.join(", "))),
    )
}

async fn listen_handler(
    State(state): State<WsState>,
    Path(channel): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    debug!(channel = %channel, "request to open channel received");

    // Reject before upgrading so the client gets a plain HTTP status
    if let Err(e) = state.hub.authorize(&channel) {
        let status = match e {
            SessionError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        };
        return (status, e.to_string()).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(channel = %channel, error = %rejection, "web socket creation failed");
            return rejection.into_response();
        }
    };

    let hub = state.hub.clone();
    ws.on_failed_upgrade(|e| warn!(error = %e, "web socket upgrade failed"))
        .on_upgrade(move |socket| {
            let tracked = hub.clone();
            tracked.track(handle_socket(socket, hub, channel))
        })
}

async fn handle_socket(socket: WebSocket, hub: Arc<EventHub>, channel: String) {
    let (sender, receiver) = socket.split();

    match hub
        .open_session(WsSink(sender), WsPeer(receiver), &channel)
        .await
    {
        Ok(end) => debug!(channel = %channel, reason = ?end, "web socket closed"),
        Err(e) => info!(channel = %channel, error = %e, "web socket closed"),
    }
}

/// Write half of an upgraded socket
pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Bytes::from_static(b"ping")),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Read half of an upgraded socket
pub struct WsPeer(SplitStream<WebSocket>);

#[async_trait]
impl PeerEvents for WsPeer {
    async fn disconnected(&mut self) {
        while let Some(msg_result) = self.0.next().await {
            match msg_result {
                Ok(Message::Close(_)) => return,
                Ok(_) => {
                    // Clients have nothing to say; pongs are handled by axum
                }
                Err(e) => {
                    debug!(error = %e, "web socket read error");
                    return;
                }
            }
        }
    }
}

/// Serve HTTP on an already bound listener until `shutdown` fires
pub async fn serve_websocket(
    listener: tokio::net::TcpListener,
    state: WsState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);
    info!(addr = %listener.local_addr()?, "serving HTTP");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
