//! Event Channel Protocol Types
//!
//! Events exchanged with the chat server over the duplex event channel.
//! The channel itself is an external collaborator; these types only fix the
//! event kinds and payload shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ConversationId, Member, Message, UserId};

/// Events sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Subscribe this connection to a conversation's room.
    /// `request_id` increases monotonically per client so a server echo can be
    /// matched against the newest request.
    JoinRoom {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
        request_id: u64,
    },
    StartTyping {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
    },
    StopTyping {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
    },
    SendMessage {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_content: Option<String>,
        /// Attachment encoded as a `data:` URL
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_data_url: Option<String>,
        /// Client-generated reference, useful for correlating the echo in logs
        client_ref: Uuid,
    },
    /// Batched presence query for every known counterparty
    CheckOnlineStatus { user_ids: Vec<UserId> },
}

/// Only the id is carried when a user stops typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
}

/// Events pushed FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(Message),
    UserTyping {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
        user: Member,
    },
    UserStoppedTyping {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
        user: UserRef,
    },
    /// Response to `CheckOnlineStatus`: the subset of queried users that are online
    OnlineUsers { user_ids: Vec<UserId> },
    /// Unsolicited single-user presence change
    PresenceChanged { user_id: UserId, online: bool },
    /// Acknowledgement of a `JoinRoom` request
    RoomJoined {
        #[serde(rename = "chat_id")]
        conversation_id: ConversationId,
        request_id: u64,
    },
    Error { message: String },
}

/// Anything a channel subscription can deliver: transport signals plus
/// decoded server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Connected,
    Disconnected { reason: String },
    Event(ServerEvent),
}

/// Discriminant used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    NewMessage,
    UserTyping,
    UserStoppedTyping,
    OnlineUsers,
    PresenceChanged,
    RoomJoined,
    Error,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::NewMessage,
        EventKind::UserTyping,
        EventKind::UserStoppedTyping,
        EventKind::OnlineUsers,
        EventKind::PresenceChanged,
        EventKind::RoomJoined,
        EventKind::Error,
    ];
}

impl Inbound {
    pub fn kind(&self) -> EventKind {
        match self {
            Inbound::Connected => EventKind::Connected,
            Inbound::Disconnected { .. } => EventKind::Disconnected,
            Inbound::Event(event) => match event {
                ServerEvent::NewMessage(_) => EventKind::NewMessage,
                ServerEvent::UserTyping { .. } => EventKind::UserTyping,
                ServerEvent::UserStoppedTyping { .. } => EventKind::UserStoppedTyping,
                ServerEvent::OnlineUsers { .. } => EventKind::OnlineUsers,
                ServerEvent::PresenceChanged { .. } => EventKind::PresenceChanged,
                ServerEvent::RoomJoined { .. } => EventKind::RoomJoined,
                ServerEvent::Error { .. } => EventKind::Error,
            },
        }
    }
}
