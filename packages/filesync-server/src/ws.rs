//! Event socket handler.
//!
//! One WebSocket per client connection: authenticate at upgrade, register a
//! bus subscriber, then pump frames both ways until the socket closes.
//! Heartbeats refresh the subscription's liveness; the bus sweeper closes
//! subscriptions that go silent past the timeout.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use filesync_core::protocol::{ClientFrame, ServerFrame};

use crate::auth::{bearer_token, AuthUser};
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/sync/ws: upgrade handler.
///
/// Auth comes from the `Authorization` header when the client can set one,
/// or a `token` query parameter otherwise. The client's real id arrives as
/// the `client_id` query parameter.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let token = match bearer_token(&headers) {
        Ok(token) => token,
        Err(_) => params
            .get("token")
            .cloned()
            .ok_or_else(|| crate::error::ApiError::Unauthorized("missing credentials".into()))?,
    };
    let claims = state.auth.verify(&token)?;
    let user = AuthUser {
        user_id: claims.sub,
        username: claims.username,
    };

    let client_id = params
        .get("client_id")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user, client_id)))
}

/// Run one socket for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser, client_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Register with the bus ─────────────────────────────────────────────

    let (handle, mut bus_rx) = state.bus.subscribe(&user.user_id, &client_id);

    // Local outbound channel: bus deliveries and protocol replies merge here.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let forward_tx = out_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = bus_rx.recv().await {
            if forward_tx.send(frame).is_err() {
                break;
            }
        }
    });

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server frame");
                }
            }
        }
    });

    tracing::info!(
        user = user.username.as_str(),
        client = client_id.as_str(),
        "Event socket connected"
    );

    // ── Read loop ─────────────────────────────────────────────────────────

    // Subscription id → destination, so unsubscribes can be resolved.
    let mut subscriptions: HashMap<String, String> = HashMap::new();

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handle_frame(&state, &handle, &out_tx, &mut subscriptions, frame),
                Err(e) => {
                    tracing::warn!(
                        client = client_id.as_str(),
                        error = %e,
                        "Unparseable client frame"
                    );
                    let _ = out_tx.send(ServerFrame::Error {
                        message: format!("invalid frame: {}", e),
                    });
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::debug!(client = client_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(client = client_id.as_str(), error = %e, "Socket error");
                break;
            }
            _ => {} // binary frames are not part of the protocol
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    state.bus.unsubscribe(&handle);
    forward_task.abort();
    sender_task.abort();
    tracing::info!(
        user = user.username.as_str(),
        client = client_id.as_str(),
        "Event socket disconnected"
    );
}

fn handle_frame(
    state: &AppState,
    handle: &crate::bus::SubscriptionHandle,
    out_tx: &mpsc::UnboundedSender<ServerFrame>,
    subscriptions: &mut HashMap<String, String>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Subscribe { id, destination } => {
            state.bus.add_destination(handle, &destination);
            subscriptions.insert(id.clone(), destination.clone());
            let _ = out_tx.send(ServerFrame::Subscribed { id, destination });
        }
        ClientFrame::Unsubscribe { id } => {
            if let Some(destination) = subscriptions.remove(&id) {
                state.bus.remove_destination(handle, &destination);
            }
        }
        ClientFrame::Heartbeat { client_id } => {
            state.bus.touch(handle);
            tracing::trace!(client = client_id.as_str(), "Heartbeat");
            let _ = out_tx.send(ServerFrame::HeartbeatAck);
        }
    }
}
