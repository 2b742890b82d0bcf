//! Streaming speech-to-text over a persistent WebSocket.

pub mod buffer;
pub mod session;
pub mod vad;

pub use session::{RealtimeSession, RealtimeSessionManager};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::{json, Value};

use crate::server::state::ServerState;

pub async fn ws_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let id = state.realtime.open();
    tracing::info!("realtime session opened: {id}");
    let mut session = RealtimeSession::new(id.clone(), state.router.clone());

    'connection: while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("realtime socket error: {e}");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        let event = json!({
                            "type": "error",
                            "error": { "message": format!("invalid JSON: {e}"), "type": "invalid_request_error" },
                        });
                        if socket.send(Message::Text(event.to_string())).await.is_err() {
                            break 'connection;
                        }
                        continue;
                    }
                };
                for event in session.handle_message(&value).await {
                    if socket.send(Message::Text(event.to_string())).await.is_err() {
                        break 'connection;
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    state.realtime.close(&id);
    tracing::info!("realtime session closed: {id}");
}
