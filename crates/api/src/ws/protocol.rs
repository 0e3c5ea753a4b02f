//! JSON messages exchanged over the notification socket, tagged by `type`.

use axum::extract::ws::Message;
use linewatch_core::types::{SequenceNumber, Timestamp};
use linewatch_events::NotificationEvent;
use serde::{Deserialize, Serialize};

/// The single topic clients subscribe to.
pub const INSPECTION_TOPIC: &str = "inspection-updates";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: String,
        timestamp: Timestamp,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Notification {
        event: NotificationEvent,
    },
    LastSequence {
        latest: SequenceNumber,
        last_acked: Option<SequenceNumber>,
    },
    CatchUp {
        events: Vec<NotificationEvent>,
        latest: SequenceNumber,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe,
    Unsubscribe,
    Ack {
        sequence: SequenceNumber,
    },
    GetLastSequence,
    CatchUp {
        last_seen: SequenceNumber,
        #[serde(default)]
        max_count: Option<usize>,
    },
}
