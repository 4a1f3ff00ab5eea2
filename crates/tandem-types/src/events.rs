use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorReason;
use crate::models::MessageView;
use crate::permissions::Access;

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection is open and authenticated
    Ready {
        user_id: Uuid,
        name: String,
        /// How often the client should poll the notification list.
        notification_poll_secs: u64,
    },

    /// A message was persisted in a channel the client joined
    MessageCreated { message: MessageView },

    /// The author removed one of their messages
    MessageDeleted { channel_id: Uuid, message_id: i64 },

    /// Room join accepted
    JoinOk { channel_id: Uuid, access: Access },

    /// Room join refused, or the client was evicted after losing view rights
    JoinError {
        channel_id: Uuid,
        reason: ErrorReason,
    },

    /// A `send_message` was rejected; nothing was persisted or broadcast
    SendError {
        channel_id: Uuid,
        reason: ErrorReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ServerEvent {
    /// Returns the channel_id if this event is routed through a room.
    /// Room-scoped events are only delivered to connections joined to that
    /// channel; the others are addressed to a single connection.
    pub fn room(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreated { message } => Some(message.message.channel_id),
            Self::MessageDeleted { channel_id, .. } => Some(*channel_id),
            // Ready, JoinOk/JoinError and SendError are per-connection replies
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinChannel { channel_id: Uuid },

    LeaveChannel { channel_id: Uuid },

    SendMessage {
        channel_id: Uuid,
        content: String,
        /// Opaque token echoed back on the authoritative copy or the error.
        #[serde(default)]
        client_token: Option<String>,
    },
}

/// Topic used on the fanout bus for a channel's room events.
pub fn channel_topic(channel_id: Uuid) -> String {
    format!("channel:{}", channel_id)
}

/// Something one server process tells the others about a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusPayload {
    /// Deliver to every local connection joined to the room.
    Room { event: ServerEvent },
    /// The user lost view rights: evict their connections from the room.
    Revoke { channel_id: Uuid, user_id: Uuid },
    /// The channel went private: evict everyone not in `viewers`.
    Restrict { channel_id: Uuid, viewers: Vec<Uuid> },
}

/// An envelope in flight between server processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Node that published the envelope. Receivers skip their own envelopes
    /// since they already acted locally.
    pub origin: Uuid,
    pub topic: String,
    pub payload: BusPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorSummary, Message};
    use chrono::Utc;

    #[test]
    fn commands_use_tagged_snake_case() {
        let channel_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"send_message","data":{{"channel_id":"{}","content":"hi"}}}}"#,
            channel_id
        );
        let cmd: ClientCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::SendMessage {
                channel_id,
                content: "hi".into(),
                client_token: None,
            }
        );
    }

    #[test]
    fn room_scoping() {
        let channel_id = Uuid::new_v4();
        let created = ServerEvent::MessageCreated {
            message: MessageView {
                message: Message {
                    id: 1,
                    channel_id,
                    user_id: Uuid::new_v4(),
                    content: "hi".into(),
                    client_token: None,
                    created_at: Utc::now(),
                },
                author: AuthorSummary {
                    id: Uuid::new_v4(),
                    name: "alice".into(),
                    avatar_url: None,
                },
            },
        };
        assert_eq!(created.room(), Some(channel_id));

        let err = ServerEvent::JoinError {
            channel_id,
            reason: ErrorReason::PermissionDenied,
        };
        assert_eq!(err.room(), None);

        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json["type"], "message_created");
        assert_eq!(json["data"]["message"]["content"], "hi");
    }

    #[test]
    fn topic_is_keyed_by_channel() {
        let id = Uuid::nil();
        assert_eq!(channel_topic(id), "channel:00000000-0000-0000-0000-000000000000");
    }
}
