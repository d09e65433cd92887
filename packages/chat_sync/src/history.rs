//! Request/response collaborator for data the push channel does not replay.

use std::future::Future;

use crate::error::FetchError;
use crate::model::{ConversationId, ConversationSummary, Member, Message};

/// Fetches backlog, rosters and the conversation list.
///
/// Implementations authenticate however they like; the sync task only calls
/// these while a session is present.
pub trait HistoryFetcher: Send + Sync + 'static {
    /// Messages of a conversation, oldest first.
    fn fetch_backlog(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<Vec<Message>, FetchError>> + Send;

    fn fetch_roster(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<Vec<Member>, FetchError>> + Send;

    fn fetch_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, FetchError>> + Send;
}
