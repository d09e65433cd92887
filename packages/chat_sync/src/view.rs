//! Read-only state handed to presentation layers.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::LoadStatus;
use crate::connection::ConnectionState;
use crate::model::{ConversationId, ConversationSummary, Message, UserId};
use crate::typing::TypingLabel;

/// Everything a presentation layer needs to draw the active conversation.
/// Collections are shared snapshots; cloning a view is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation_id: Option<ConversationId>,
    pub messages: Arc<Vec<Message>>,
    pub status: LoadStatus,
    /// The server acknowledged the join for this conversation's room.
    pub joined: bool,
    pub typing: TypingLabel,
    /// Some roster member other than the local user is online.
    pub online: bool,
    pub connection: ConnectionState,
    pub online_users: Arc<BTreeSet<UserId>>,
    pub conversations: Arc<Vec<ConversationSummary>>,
    /// Most recent error pushed by the server
    pub last_error: Option<String>,
}

impl Default for ConversationView {
    fn default() -> Self {
        Self {
            conversation_id: None,
            messages: Arc::new(Vec::new()),
            status: LoadStatus::NotLoaded,
            joined: false,
            typing: TypingLabel::Nobody,
            online: false,
            connection: ConnectionState::Disconnected,
            online_users: Arc::new(BTreeSet::new()),
            conversations: Arc::new(Vec::new()),
            last_error: None,
        }
    }
}

impl ConversationView {
    pub fn typing_text(&self) -> Option<String> {
        self.typing.render()
    }

    pub fn load_error(&self) -> Option<&str> {
        match &self.status {
            LoadStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}
