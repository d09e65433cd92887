//! Room Subscription Tracker
//!
//! Joins the channel room for the active conversation. Membership is scoped to
//! one connection, so every reconnect re-joins. Only the newest request
//! matters; an acknowledgement for an older request is ignored.

use tracing::{debug, info};

use crate::model::ConversationId;
use crate::protocol::ClientEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoomState {
    None,
    Pending {
        conversation: ConversationId,
        request_id: u64,
    },
    Joined(ConversationId),
}

#[derive(Debug)]
pub struct RoomTracker {
    active: Option<ConversationId>,
    state: RoomState,
    next_request: u64,
}

impl Default for RoomTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomTracker {
    pub fn new() -> Self {
        Self {
            active: None,
            state: RoomState::None,
            next_request: 0,
        }
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// The room the server has confirmed for the active conversation.
    pub fn joined(&self) -> Option<&ConversationId> {
        match &self.state {
            RoomState::Joined(conversation) => Some(conversation),
            _ => None,
        }
    }

    /// Change the active conversation. Returns the join to emit, if any.
    ///
    /// Setting the same id again re-issues the join: the previous request may
    /// have been lost with a dropped connection.
    pub fn set_active(
        &mut self,
        conversation: Option<ConversationId>,
        connected: bool,
    ) -> Option<ClientEvent> {
        if let Some(old) = self.active.as_ref().filter(|old| conversation.as_ref() != Some(*old)) {
            debug!(conversation = %old, "Forgetting room");
        }
        self.active = conversation;
        self.state = RoomState::None;
        if connected { self.join() } else { None }
    }

    /// The connection came up: re-join the active room, if any.
    pub fn on_connected(&mut self) -> Option<ClientEvent> {
        self.join()
    }

    pub fn on_disconnected(&mut self) {
        self.state = RoomState::None;
    }

    /// Apply a join acknowledgement. Only the outstanding request can be
    /// confirmed.
    pub fn on_joined(&mut self, conversation: &ConversationId, request_id: u64) {
        match &self.state {
            RoomState::Pending {
                conversation: pending,
                request_id: expected,
            } if pending == conversation && *expected == request_id => {
                info!(%conversation, request_id, "Room joined");
                self.state = RoomState::Joined(conversation.clone());
            }
            _ => {
                debug!(%conversation, request_id, "Ignoring stale room ack");
            }
        }
    }

    fn join(&mut self) -> Option<ClientEvent> {
        let conversation = self.active.clone()?;
        self.next_request += 1;
        let request_id = self.next_request;
        debug!(%conversation, request_id, "Joining room");
        self.state = RoomState::Pending {
            conversation: conversation.clone(),
            request_id,
        };
        Some(ClientEvent::JoinRoom {
            conversation_id: conversation,
            request_id,
        })
    }
}
