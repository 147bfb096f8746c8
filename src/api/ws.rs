// =============================================================================
// WebSocket handlers — `/ws/status` and `/ws/stream`
// =============================================================================
//
// Clients connect with optional `?strategy=`, `?token=`, and `?format=`
// (`raw` JSON, the default, or `msgpack-zlib`). The server pushes on a timer
// whenever `state_version` has changed since the last push — the same
// version-gated push loop as the teacher's `/api/v1/ws` handler.

use std::io::Write;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    strategy: Option<String>,
    token: Option<String>,
    #[serde(default)]
    format: Format,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum Format {
    #[default]
    Raw,
    MsgpackZlib,
}

pub async fn status_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, q, Feed::Status).await
}

pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, q, Feed::Stream).await
}

#[derive(Clone, Copy)]
enum Feed {
    Status,
    Stream,
}

async fn upgrade(ws: WebSocketUpgrade, state: Arc<AppState>, q: WsQuery, feed: Feed) -> axum::response::Response {
    let token = q.token.clone().unwrap_or_default();
    if !validate_token(&token) {
        warn!("websocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "invalid or missing token").into_response();
    }

    info!(strategy = ?q.strategy, "websocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle(socket, state, q.strategy, q.format, feed)).into_response()
}

async fn handle(socket: WebSocket, state: Arc<AppState>, strategy: Option<String>, format: Format, feed: Feed) {
    let (mut sender, mut receiver) = socket.split();

    if let Err(err) = push(&mut sender, &state, &strategy, format, feed).await {
        debug!(%err, "failed to send initial websocket payload");
        return;
    }
    let mut last_sent_version = state.state_version();

    let mut push_interval = interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current = state.state_version();
                if current != last_sent_version {
                    match push(&mut sender, &state, &strategy, format, feed).await {
                        Ok(()) => last_sent_version = current,
                        Err(err) => {
                            debug!(%err, "websocket send failed — disconnecting");
                            break;
                        }
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("websocket connection closed");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "websocket receive error — disconnecting");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[derive(Serialize)]
struct StatusPayload {
    state_version: u64,
    server_time: i64,
    status: serde_json::Value,
}

#[derive(Serialize)]
struct StreamPayload {
    state_version: u64,
    server_time: i64,
    snapshot: serde_json::Value,
    recent_events: Vec<serde_json::Value>,
}

async fn push(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
    strategy: &Option<String>,
    format: Format,
    feed: Feed,
) -> Result<(), axum::Error> {
    state.next_ws_sequence();

    let payload = match feed {
        Feed::Status => {
            let status = match strategy {
                Some(sid) => serde_json::to_value(state.status_for(sid)).unwrap_or(serde_json::Value::Null),
                None => serde_json::to_value(state.all_status()).unwrap_or(serde_json::Value::Null),
            };
            serde_json::to_value(StatusPayload {
                state_version: state.state_version(),
                server_time: chrono::Utc::now().timestamp_millis(),
                status,
            })
        }
        Feed::Stream => serde_json::to_value(StreamPayload {
            state_version: state.state_version(),
            server_time: chrono::Utc::now().timestamp_millis(),
            snapshot: state.stream_snapshot(),
            recent_events: state.recent_events(20),
        }),
    };

    let Ok(payload) = payload else {
        return Ok(());
    };

    match format {
        Format::Raw => {
            let Ok(text) = serde_json::to_string(&payload) else { return Ok(()) };
            sender.send(Message::Text(text.into())).await
        }
        Format::MsgpackZlib => {
            let Ok(packed) = rmp_serde::to_vec(&payload) else { return Ok(()) };
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            if encoder.write_all(&packed).is_err() {
                return Ok(());
            }
            let Ok(compressed) = encoder.finish() else { return Ok(()) };
            sender.send(Message::Binary(compressed.into())).await
        }
    }
}
