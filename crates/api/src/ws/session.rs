//! Per-connection protocol state: subscription, acknowledgements, catch-up.

use std::sync::Arc;

use linewatch_events::FanOutNotifier;
use tokio::task::JoinHandle;

use crate::ws::manager::WsManager;
use crate::ws::protocol::{ClientMessage, ServerMessage, INSPECTION_TOPIC};

/// Sent when the notifier drops a subscriber that fell behind.
pub const SUBSCRIPTION_DROPPED: &str = "Subscription dropped, catch up and subscribe again";

/// Protocol handling for one socket.
///
/// While subscribed, a forwarder task relays the notifier's live events to
/// the connection's outbound channel.
pub struct Session {
    connection_id: String,
    notifier: Arc<FanOutNotifier>,
    ws_manager: Arc<WsManager>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        connection_id: String,
        notifier: Arc<FanOutNotifier>,
        ws_manager: Arc<WsManager>,
    ) -> Self {
        Self {
            connection_id,
            notifier,
            ws_manager,
            forwarder: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Parse and act on one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                tracing::debug!(conn_id = %self.connection_id, error = %e, "Unparseable client message");
                self.reply(ServerMessage::error(format!("Invalid message: {e}")))
                    .await;
            }
        }
    }

    pub async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe => self.subscribe().await,
            ClientMessage::Unsubscribe => {
                self.unsubscribe().await;
                self.reply(ServerMessage::Unsubscribed {
                    topic: INSPECTION_TOPIC.to_string(),
                })
                .await;
            }
            ClientMessage::Ack { sequence } => {
                if self.notifier.ack(&self.connection_id, sequence).await.is_none() {
                    self.reply(ServerMessage::error("Not subscribed")).await;
                }
            }
            ClientMessage::GetLastSequence => {
                let reply = match self.notifier.latest().await {
                    Ok(latest) => ServerMessage::LastSequence {
                        latest,
                        last_acked: self.notifier.last_acked(&self.connection_id).await,
                    },
                    Err(e) => {
                        tracing::warn!(conn_id = %self.connection_id, error = %e, "Latest sequence unavailable");
                        ServerMessage::error("Latest sequence unavailable")
                    }
                };
                self.reply(reply).await;
            }
            ClientMessage::CatchUp {
                last_seen,
                max_count,
            } => {
                if last_seen < 0 {
                    self.reply(ServerMessage::error("last_seen cannot be negative"))
                        .await;
                    return;
                }
                let reply = match self
                    .notifier
                    .catch_up(
                        &self.connection_id,
                        last_seen,
                        max_count.unwrap_or(usize::MAX),
                    )
                    .await
                {
                    Ok(caught_up) => ServerMessage::CatchUp {
                        events: caught_up.events,
                        latest: caught_up.latest,
                    },
                    Err(e) => {
                        tracing::warn!(conn_id = %self.connection_id, error = %e, "Catch-up failed");
                        ServerMessage::error("Catch-up unavailable")
                    }
                };
                self.reply(reply).await;
            }
        }
    }

    async fn subscribe(&mut self) {
        let Some(sender) = self.ws_manager.sender(&self.connection_id).await else {
            return;
        };
        self.stop_forwarder();

        let mut events = self.notifier.subscribe(&self.connection_id).await;
        // Confirmation goes out before any forwarded notification.
        self.reply(ServerMessage::Subscribed {
            topic: INSPECTION_TOPIC.to_string(),
        })
        .await;

        let conn_id = self.connection_id.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let sequence = event.sequence_number;
                let frame = match (ServerMessage::Notification { event }).to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(conn_id = %conn_id, sequence, error = %e, "Failed to encode notification");
                        continue;
                    }
                };
                if sender.send(frame).is_err() {
                    break;
                }
            }
            // Reached only when the notifier dropped this subscriber;
            // unsubscribing aborts the task first.
            tracing::debug!(conn_id = %conn_id, "Notification forwarder finished");
            if let Ok(frame) = ServerMessage::error(SUBSCRIPTION_DROPPED).to_frame() {
                let _ = sender.send(frame);
            }
        }));
        tracing::info!(conn_id = %self.connection_id, "Subscribed to inspection updates");
    }

    async fn unsubscribe(&mut self) {
        self.stop_forwarder();
        if self.notifier.unsubscribe(&self.connection_id).await {
            tracing::info!(conn_id = %self.connection_id, "Unsubscribed from inspection updates");
        }
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    async fn reply(&self, message: ServerMessage) {
        self.ws_manager.send_to(&self.connection_id, &message).await;
    }

    /// Drop the subscription; called when the socket closes.
    pub async fn close(mut self) {
        self.unsubscribe().await;
    }
}
