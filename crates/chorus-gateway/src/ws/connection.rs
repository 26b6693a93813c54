use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chorus_core::types::now_rfc3339;
use chorus_fabric::{ConnectionId, ServerEvent};

use crate::app::AppState;

/// Outbound queue depth per connection; slow consumers get evicted by the
/// router when this backs up.
const OUTBOUND_BUFFER: usize = 256;

/// Inbound frames from the client.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    RegisterUser { user_id: String },
    JoinSession { session_id: String },
    LeaveSession { session_id: String },
    Typing { session_id: String },
    Heartbeat,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task — lives for the entire socket lifetime.
///
/// A connection starts anonymous; `register_user` binds it to a user,
/// wires it into the router/optimizer/presence, and replays the user's
/// backlog. Everything is unwound on close.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);

    if send_event(
        &mut sink,
        &ServerEvent::Connected {
            timestamp: now_rfc3339(),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let mut registered: Option<(String, ConnectionId)> = None;

    loop {
        tokio::select! {
            // outbound: events routed to this connection
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // inbound: client frames
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(f) => f,
                            Err(e) => {
                                debug!(error = %e, "malformed client frame, ignoring");
                                continue;
                            }
                        };
                        handle_frame(frame, &state, &tx, &mut registered, &mut sink).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some((user_id, conn_id)) = registered {
        state.router.unregister_connection(&user_id, &conn_id);
        if !state.router.is_connected(&user_id) {
            state.optimizer.unregister_user(&user_id);
            state.presence.set_offline(&user_id);
        }
        info!(user_id, "ws connection closed");
    }
}

async fn handle_frame(
    frame: ClientFrame,
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerEvent>,
    registered: &mut Option<(String, ConnectionId)>,
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) {
    match frame {
        ClientFrame::RegisterUser { user_id } => {
            if registered.is_some() {
                debug!(user_id, "connection already registered, ignoring");
                return;
            }
            // registration drains the router spool into this connection
            let conn_id = state.router.register_connection(&user_id, tx.clone());
            state.optimizer.register_user(&user_id);
            state.presence.heartbeat(&user_id);
            *registered = Some((user_id.clone(), conn_id));
            info!(user_id, "ws user registered");

            let _ = send_event(
                sink,
                &ServerEvent::Registered {
                    user_id: user_id.clone(),
                    timestamp: now_rfc3339(),
                },
            )
            .await;

            // replay accumulated notifications without blocking the
            // connection loop
            let notifications = state.notifications.clone();
            tokio::spawn(async move {
                notifications.drain_offline(&user_id).await;
            });
        }

        ClientFrame::JoinSession { session_id } => {
            let Some((user_id, _)) = registered.as_ref() else {
                return;
            };
            state
                .integrator
                .register_user_activity(&session_id, user_id, "join")
                .await;
            debug!(user_id, session_id, "joined session");
        }

        ClientFrame::LeaveSession { session_id } => {
            let Some((user_id, _)) = registered.as_ref() else {
                return;
            };
            debug!(user_id, session_id, "left session");
        }

        ClientFrame::Typing { session_id } => {
            let Some((user_id, _)) = registered.as_ref() else {
                return;
            };
            if let Err(e) = state.chat.notify_typing(&session_id, user_id).await {
                debug!(user_id, session_id, error = %e, "typing rejected");
            }
        }

        ClientFrame::Heartbeat => {
            if let Some((user_id, _)) = registered.as_ref() {
                state.presence.heartbeat(user_id);
            }
        }
    }
}

async fn send_event(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(json.into()))
        .await
        .map_err(axum::Error::new)
}
