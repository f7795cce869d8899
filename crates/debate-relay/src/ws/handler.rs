use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use debate_protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.connections.add_connection(connection_id, tx.clone()).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(text.as_str()) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message on {}: {}", connection_id, e);
                        state
                            .connections
                            .send_to_connection(
                                connection_id,
                                ServerMessage::Error {
                                    request_id: None,
                                    message: "Invalid message format".to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                handle_client_message(&state, connection_id, &tx, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    let subscriptions = state.connections.remove_connection(connection_id).await;
    state.store.unsubscribe_all(&subscriptions).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Connection {} disconnected from WebSocket", connection_id);
}

async fn handle_client_message(
    state: &AppState,
    connection_id: Uuid,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    let response = match message {
        ClientMessage::Publish {
            request_id,
            session_id,
            signal,
        } => match state.store.publish(&session_id, signal).await {
            Ok(signal_id) => ServerMessage::Published {
                request_id,
                signal_id,
            },
            Err(e) => ServerMessage::Error {
                request_id: Some(request_id),
                message: e.to_string(),
            },
        },
        ClientMessage::SubscribeInbox {
            request_id,
            session_id,
            recipient,
        } => {
            let subscription_id = state.store.allocate_subscription();
            state
                .connections
                .track_subscription(connection_id, subscription_id)
                .await;
            // Announce the id before the backlog arrives on it
            let _ = tx.send(ServerMessage::Subscribed {
                request_id,
                subscription_id,
            });
            state
                .store
                .open_inbox(subscription_id, &session_id, &recipient, tx.clone())
                .await;
            return;
        }
        ClientMessage::WatchSession {
            request_id,
            session_id,
        } => {
            let subscription_id = state.store.allocate_subscription();
            state
                .connections
                .track_subscription(connection_id, subscription_id)
                .await;
            let _ = tx.send(ServerMessage::Subscribed {
                request_id,
                subscription_id,
            });
            state
                .store
                .open_watch(subscription_id, &session_id, tx.clone())
                .await;
            return;
        }
        ClientMessage::Ack {
            request_id,
            session_id,
            signal_id,
        } => {
            // Acking an already deleted signal is fine under redelivery
            if !state.store.ack(&session_id, signal_id).await {
                tracing::debug!("Signal {} in {} was already acked", signal_id, session_id);
            }
            ServerMessage::Done { request_id }
        }
        ClientMessage::Unsubscribe {
            request_id,
            subscription_id,
        } => {
            if state
                .connections
                .untrack_subscription(connection_id, subscription_id)
                .await
            {
                state.store.unsubscribe(subscription_id).await;
                ServerMessage::Done { request_id }
            } else {
                ServerMessage::Error {
                    request_id: Some(request_id),
                    message: format!("Unknown subscription {}", subscription_id),
                }
            }
        }
        ClientMessage::JoinSession {
            request_id,
            session_id,
            uid,
        } => match state.store.join(&session_id, uid).await {
            Ok(_) => ServerMessage::Done { request_id },
            Err(e) => ServerMessage::Error {
                request_id: Some(request_id),
                message: e.to_string(),
            },
        },
        ClientMessage::LeaveSession {
            request_id,
            session_id,
            uid,
        } => {
            state.store.leave(&session_id, &uid).await;
            ServerMessage::Done { request_id }
        }
        ClientMessage::Ping => ServerMessage::Pong,
    };

    state
        .connections
        .send_to_connection(connection_id, response)
        .await;
}
