/// WebSocket endpoint of the signaling relay
use crate::domain::relay::{RelayConnection, SignalingRelay};
use crate::domain::signaling::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Create the signaling router
pub fn signaling_router(relay: Arc<SignalingRelay>) -> Router {
    Router::new()
        .route("/signaling", get(websocket_handler))
        .with_state(relay)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<SignalingRelay>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Handle one signaling connection.
///
/// Frames from the client are processed in arrival order on this task;
/// relay output is written by a separate task draining the connection's
/// outbound queue.
async fn handle_socket(socket: WebSocket, relay: Arc<SignalingRelay>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut connection = RelayConnection::open(relay, tx);
    let participant_id = connection.participant_id().clone();

    info!("Signaling client {} connected", participant_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        debug!("Failed to send to signaling client");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize signaling message: {}", e);
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => connection.handle(message).await,
                        Err(e) => {
                            debug!("Malformed frame from {}: {}", participant_id, e);
                            counter!("relay_parse_errors_total").increment(1);
                            connection.reject("PARSE_ERROR", e.to_string());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", participant_id, e);
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    connection.close().await;
    send_task.abort();

    info!("Signaling client {} disconnected", participant_id);
}
