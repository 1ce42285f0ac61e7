//! Event socket client.
//!
//! Maintains a persistent WebSocket to the server's event endpoint,
//! subscribes to the per-user `file-changes` and `conflicts` queues, sends a
//! heartbeat every 30 seconds, and reconnects with backoff for as long as
//! the transport is running. Connection state changes are reported through a
//! `connected: bool` callback so the app layer can reflect them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;

use crate::error::{Error, Result};
use crate::protocol::{
    ClientFrame, ServerFrame, SyncEventDto, SyncEventType, CONFLICTS_DESTINATION,
    FILE_CHANGES_DESTINATION,
};

/// Interval between heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no heartbeat ack for this long is considered dead.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Initial reconnect delay; doubles up to [`MAX_RECONNECT_DELAY`] and resets
/// after a successful connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// An event demultiplexed off the socket.
#[derive(Debug, Clone)]
pub enum IncomingEvent {
    /// A peer client created, modified, or deleted a file.
    FileChange(SyncEventDto),
    /// The server detected a concurrent edit on one of our files.
    Conflict(SyncEventDto),
}

/// Callback invoked on connection state changes.
pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle to the running event transport.
pub struct EventTransport {
    ws_url: String,
    client_id: String,
    token: RwLock<String>,
    should_reconnect: AtomicBool,
    /// Bumped to force the active connection to close (token rotation,
    /// shutdown). Each connection holds a receiver.
    restart: watch::Sender<u64>,
    on_status: StatusCallback,
}

impl EventTransport {
    /// Start the transport. Returns the handle and the stream of incoming
    /// events. The connection loop runs until [`EventTransport::shutdown`].
    pub fn spawn(
        ws_url: String,
        token: String,
        client_id: String,
        on_status: StatusCallback,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingEvent>) {
        let (restart, _) = watch::channel(0u64);
        let transport = Arc::new(Self {
            ws_url,
            client_id,
            token: RwLock::new(token),
            should_reconnect: AtomicBool::new(true),
            restart,
            on_status,
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = transport.clone();
        tokio::spawn(async move {
            runner.run(events_tx).await;
        });

        (transport, events_rx)
    }

    /// Replace the bearer token and re-open the connection with it.
    pub fn rotate_token(&self, token: String) {
        *self.token.write().expect("token lock") = token;
        self.restart.send_modify(|gen| *gen += 1);
        tracing::info!("Event transport token rotated, reconnecting");
    }

    /// Stop reconnecting and close the active connection.
    pub fn shutdown(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.restart.send_modify(|gen| *gen += 1);
    }

    /// Reconnect-forever loop.
    async fn run(self: Arc<Self>, events_tx: mpsc::UnboundedSender<IncomingEvent>) {
        let mut delay = RECONNECT_DELAY;

        while self.should_reconnect.load(Ordering::SeqCst) {
            match self.connect_once(&events_tx).await {
                Ok(()) => {
                    // Clean close (shutdown or token rotation)
                    delay = RECONNECT_DELAY;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Event socket connection failed");
                }
            }

            (self.on_status)(false);

            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }

            tracing::info!(
                delay_secs = delay.as_secs(),
                "Reconnecting to event socket after backoff"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// One connection lifetime: connect, subscribe, pump frames.
    async fn connect_once(
        &self,
        events_tx: &mpsc::UnboundedSender<IncomingEvent>,
    ) -> Result<()> {
        let url = format!("{}?client_id={}", self.ws_url, self.client_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let token = self.token.read().expect("token lock").clone();
        let header = format!("Bearer {}", token)
            .parse()
            .map_err(|_| Error::Transport("bearer token is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", header);

        let (ws_stream, _) = connect_async(request).await?;
        let (mut sender, mut receiver) = ws_stream.split();

        // Subscribe to both per-user queues
        for (id, destination) in [
            ("sub-file-changes", FILE_CHANGES_DESTINATION),
            ("sub-conflicts", CONFLICTS_DESTINATION),
        ] {
            let frame = ClientFrame::Subscribe {
                id: id.to_string(),
                destination: destination.to_string(),
            };
            sender
                .send(WsMessage::Text(serde_json::to_string(&frame)?))
                .await?;
        }

        tracing::info!(client_id = self.client_id.as_str(), "Event socket connected");
        (self.on_status)(true);

        let mut restart_rx = self.restart.subscribe();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // immediate first tick
        let mut last_ack = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_ack.elapsed() > HEARTBEAT_TIMEOUT {
                        return Err(Error::Transport(
                            "no heartbeat ack within 90s".into(),
                        ));
                    }
                    let frame = ClientFrame::Heartbeat {
                        client_id: self.client_id.clone(),
                    };
                    sender
                        .send(WsMessage::Text(serde_json::to_string(&frame)?))
                        .await?;
                }

                _ = restart_rx.changed() => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    return Ok(());
                }

                msg = receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(frame) => {
                                    if let ServerFrame::HeartbeatAck = frame {
                                        last_ack = tokio::time::Instant::now();
                                    }
                                    if let Some(event) = demux(frame) {
                                        if events_tx.send(event).is_err() {
                                            return Ok(()); // consumer gone
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "Unparseable server frame");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Err(Error::Transport("server closed connection".into()));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Route a server frame to the event stream, dropping acks and bookkeeping.
fn demux(frame: ServerFrame) -> Option<IncomingEvent> {
    match frame {
        ServerFrame::Event { destination, event } => {
            if destination == CONFLICTS_DESTINATION
                || event.event_type == SyncEventType::Conflict
            {
                Some(IncomingEvent::Conflict(event))
            } else {
                Some(IncomingEvent::FileChange(event))
            }
        }
        ServerFrame::Subscribed { id, destination } => {
            tracing::debug!(id = id.as_str(), destination = destination.as_str(), "Subscribed");
            None
        }
        ServerFrame::HeartbeatAck => None,
        ServerFrame::Error { message } => {
            tracing::warn!(message = message.as_str(), "Server frame error");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::protocol::EventStatus;

    fn event(event_type: SyncEventType) -> SyncEventDto {
        SyncEventDto {
            event_id: "evt-1".to_string(),
            event_type,
            user_id: "user-1".to_string(),
            file_id: Some("file-1".to_string()),
            file_path: Some("a.txt".to_string()),
            checksum: None,
            file_size: None,
            client_id: "client-b".to_string(),
            timestamp: Utc::now(),
            sync_status: EventStatus::Completed,
            version_vector: None,
        }
    }

    #[test]
    fn test_demux_routes_by_destination() {
        let change = demux(ServerFrame::Event {
            destination: FILE_CHANGES_DESTINATION.to_string(),
            event: event(SyncEventType::Modify),
        });
        assert!(matches!(change, Some(IncomingEvent::FileChange(_))));

        let conflict = demux(ServerFrame::Event {
            destination: CONFLICTS_DESTINATION.to_string(),
            event: event(SyncEventType::Conflict),
        });
        assert!(matches!(conflict, Some(IncomingEvent::Conflict(_))));
    }

    #[test]
    fn test_demux_conflict_event_type_wins() {
        // A conflict event delivered on the file-changes queue still routes
        // to the conflict handler.
        let routed = demux(ServerFrame::Event {
            destination: FILE_CHANGES_DESTINATION.to_string(),
            event: event(SyncEventType::Conflict),
        });
        assert!(matches!(routed, Some(IncomingEvent::Conflict(_))));
    }

    #[test]
    fn test_demux_drops_bookkeeping_frames() {
        assert!(demux(ServerFrame::HeartbeatAck).is_none());
        assert!(demux(ServerFrame::Subscribed {
            id: "s".to_string(),
            destination: FILE_CHANGES_DESTINATION.to_string()
        })
        .is_none());
        assert!(demux(ServerFrame::Error {
            message: "nope".to_string()
        })
        .is_none());
    }
}
