//! The WebSocket front-end.
//!
//! Each accepted connection gets a session id and a bus subscription (all
//! event types, or the subset named in the handshake query). Events are
//! sent as JSON envelopes `{"type","ts","sessionID","data"}`. A failed
//! write closes the connection; instance shutdown closes every connection
//! after a short grace interval.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::HeaderMap;
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use almanac_core::Instance;
use almanac_events::{Event, EventType};

/// Grace interval between the close frame and dropping the socket at
/// shutdown.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

pub async fn events_handler(
    instance: Arc<Instance>,
    upgrade: WebSocketUpgrade,
    headers: HeaderMap,
    query: Option<String>,
) -> Response {
    // The subprotocol token identifies the client; echo the first offer so
    // the handshake completes.
    let protocol = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let types = query.as_deref().map(parse_types).unwrap_or_default();
    let session_id = uuid::Uuid::new_v4().to_string();

    let upgrade = match &protocol {
        Some(protocol) => upgrade.protocols([protocol.clone()]),
        None => upgrade,
    };
    debug!(session_id = %session_id, client = ?protocol, "websocket connecting");
    upgrade.on_upgrade(move |socket| run_connection(instance, socket, session_id, types))
}

/// Event types named in a `types=a,b` query parameter; unknown names are
/// ignored.
fn parse_types(query: &str) -> Vec<EventType> {
    form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "types")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .filter_map(|name| {
                    serde_json::from_value(serde_json::Value::String(name.trim().to_string())).ok()
                })
                .collect::<Vec<EventType>>()
        })
        .collect()
}

async fn run_connection(
    instance: Arc<Instance>,
    mut socket: WebSocket,
    session_id: String,
    types: Vec<EventType>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let subscription = instance
        .bus()
        .subscribe(&types, move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)
                    .map_err(|_| "websocket subscriber gone".into())
            }
        })
        .await;

    let shutdown = instance.root_token().child_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                tokio::time::sleep(CLOSE_GRACE).await;
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let envelope = match serde_json::to_string(&event) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(session_id = %session_id, error = %err, "could not encode event");
                        continue;
                    }
                };
                if let Err(err) = socket.send(Message::Text(envelope.into())).await {
                    warn!(session_id = %session_id, error = %err, "websocket write failed, closing");
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Err(err)) => {
                        warn!(session_id = %session_id, error = %err, "websocket read failed");
                        break;
                    }
                    // Clients only listen on this endpoint.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    // Every exit path lands here; without this the dead handler would be
    // invoked on every later publish.
    instance.bus().unsubscribe(subscription).await;
    debug!(session_id = %session_id, "websocket closed");
}
