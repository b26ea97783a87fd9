//! ---
//! vsub_section: "04-external-interfaces"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Status frame stream for dashboard observers."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use vsub_core::StatusFrame;

use crate::rest::{ApiState, StatusProvider};

pub(crate) async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> Response {
    let provider = state.provider.clone();
    ws.on_upgrade(move |socket| client_loop(socket, provider))
}

/// Sends the current frame on connect, then relays every broadcast frame.
/// The stream is read-only; inbound text is answered with an error.
async fn client_loop(mut socket: WebSocket, provider: Arc<dyn StatusProvider>) {
    let mut subscription = provider.subscribe();
    if send_frame(&mut socket, &provider.status()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status observer lagged behind; dropping frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        let _ = socket
                            .send(Message::Text("{\"error\":\"status stream is read-only\"}".into()))
                            .await;
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }
    debug!("status observer disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &StatusFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|err| {
        warn!(error = %err, "failed to serialise status frame");
    })?;
    socket.send(Message::Text(text)).await.map_err(|_| ())
}
