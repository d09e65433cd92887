//! Sync Core
//!
//! Wires the components together behind one synchronous state machine. Every
//! input (session change, inbound event, user command, fetch result, timer
//! tick) runs to completion here before the next one is looked at, so none of
//! the components need locking.
//!
//! I/O that has to wait is returned as an [`Effect`]; the caller performs it
//! and feeds the result back through [`SyncCore::apply_fetch`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cache::{LoadTicket, MessageCache};
use crate::clock::Clock;
use crate::channel::ChannelFactory;
use crate::composer::{Composer, SendReceipt};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState, SessionTransition};
use crate::error::{FetchError, ValidationError};
use crate::model::{Attachment, ConversationId, ConversationSummary, Member, Message, Session, UserId};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientEvent, Inbound, ServerEvent};
use crate::room::RoomTracker;
use crate::typing::TypingEngine;
use crate::view::ConversationView;

/// I/O the core wants performed on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchBacklog(LoadTicket),
    FetchRoster {
        conversation: ConversationId,
        epoch: u64,
    },
    FetchConversations {
        epoch: u64,
    },
}

/// Completed I/O, fed back into the core.
#[derive(Debug)]
pub enum FetchOutcome {
    Backlog {
        ticket: LoadTicket,
        result: Result<Vec<Message>, FetchError>,
    },
    Roster {
        conversation: ConversationId,
        epoch: u64,
        result: Result<Vec<Member>, FetchError>,
    },
    Conversations {
        epoch: u64,
        result: Result<Vec<ConversationSummary>, FetchError>,
    },
}

pub struct SyncCore {
    clock: Arc<dyn Clock>,
    connection: ConnectionManager,
    rooms: RoomTracker,
    cache: MessageCache,
    typing: TypingEngine,
    presence: PresenceTracker,
    composer: Composer,
    conversations: Arc<Vec<ConversationSummary>>,
    rosters: HashMap<ConversationId, Vec<Member>>,
    /// Bumped on every session change; results from older sessions are dropped.
    epoch: u64,
    last_error: Option<String>,
}

impl SyncCore {
    pub fn new(config: &SyncConfig, factory: Arc<dyn ChannelFactory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            connection: ConnectionManager::new(factory),
            rooms: RoomTracker::new(),
            cache: MessageCache::new(),
            typing: TypingEngine::new(config.typing_inactivity, config.remote_typing_ceiling),
            presence: PresenceTracker::new(),
            composer: Composer::new(config.max_attachment_bytes),
            conversations: Arc::new(Vec::new()),
            rosters: HashMap::new(),
            epoch: 0,
            last_error: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.connection.session()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.rooms.active()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Follow the session provider. A different user starts from scratch; new
    /// credentials for the same user behave like a reconnect.
    pub fn set_session(&mut self, session: Option<&Session>) -> Vec<Effect> {
        match self.connection.set_session(session) {
            SessionTransition::Unchanged => return Vec::new(),
            SessionTransition::Reopened => {
                self.rooms.on_disconnected();
                self.presence.on_disconnected();
                self.typing.on_disconnected();
                return Vec::new();
            }
            SessionTransition::Opened | SessionTransition::Closed | SessionTransition::Replaced => {}
        }

        self.epoch += 1;
        let user = session.map(|s| s.user_id.clone());
        self.rooms.set_active(None, false);
        self.typing.on_disconnected();
        self.typing.switch(None);
        self.typing.set_local_user(user.clone());
        self.presence.set_local_user(user);
        self.cache.clear();
        self.rosters.clear();
        self.conversations = Arc::new(Vec::new());
        self.composer.clear_draft();
        self.last_error = None;

        match session {
            Some(_) => vec![Effect::FetchConversations { epoch: self.epoch }],
            None => Vec::new(),
        }
    }

    /// Next inbound event from the connection; pending while there is none.
    pub async fn recv(&mut self) -> Inbound {
        self.connection.recv().await
    }

    pub fn handle_inbound(&mut self, inbound: Inbound) -> Vec<Effect> {
        match inbound {
            Inbound::Connected => self.on_connected(),
            Inbound::Disconnected { reason } => {
                self.on_disconnected(&reason);
                Vec::new()
            }
            Inbound::Event(event) => {
                self.on_event(event);
                Vec::new()
            }
        }
    }

    fn on_connected(&mut self) -> Vec<Effect> {
        if !self.connection.mark_connected() {
            return Vec::new();
        }
        if let Some(join) = self.rooms.on_connected() {
            self.emit(join);
        }
        if let Some(query) = self.presence.query() {
            self.emit(query);
        }
        // Catch up on anything pushed while we were away.
        let mut effects = Vec::new();
        if let Some(active) = self.rooms.active().cloned() {
            effects.extend(self.cache.load(&active).fetch.map(Effect::FetchBacklog));
        }
        effects
    }

    fn on_disconnected(&mut self, reason: &str) {
        self.connection.mark_disconnected(reason);
        self.rooms.on_disconnected();
        self.presence.on_disconnected();
        self.typing.on_disconnected();
    }

    fn on_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(message) => {
                self.cache.on_push(message);
            }
            ServerEvent::UserTyping {
                conversation_id,
                user,
            } => {
                let now = self.clock.now();
                self.typing.on_remote_started(&conversation_id, user, now);
            }
            ServerEvent::UserStoppedTyping {
                conversation_id,
                user,
            } => {
                self.typing.on_remote_stopped(&conversation_id, &user.id);
            }
            ServerEvent::OnlineUsers { user_ids } => {
                self.presence.on_response(user_ids);
            }
            ServerEvent::PresenceChanged { user_id, online } => {
                self.presence.on_presence_changed(user_id, online);
            }
            ServerEvent::RoomJoined {
                conversation_id,
                request_id,
            } => {
                self.rooms.on_joined(&conversation_id, request_id);
            }
            ServerEvent::Error { message } => {
                warn!(%message, "Server reported an error");
                self.last_error = Some(message);
            }
        }
    }

    /// Make `conversation` the active one. Activating the current conversation
    /// again re-joins its room and refreshes its backlog.
    pub fn activate(&mut self, conversation: Option<ConversationId>) -> Vec<Effect> {
        if self.connection.session().is_none() {
            debug!(?conversation, "Ignoring activation without a session");
            return Vec::new();
        }
        if let Some(stop) = self.typing.switch(conversation.clone()) {
            self.emit(stop);
        }
        if self.rooms.active() != conversation.as_ref() {
            self.composer.clear_draft();
        }
        if let Some(join) = self
            .rooms
            .set_active(conversation.clone(), self.connection.is_connected())
        {
            self.emit(join);
        }

        let Some(conversation) = conversation else {
            return Vec::new();
        };
        info!(%conversation, "Activated conversation");
        let mut effects: Vec<Effect> = self
            .cache
            .load(&conversation)
            .fetch
            .map(Effect::FetchBacklog)
            .into_iter()
            .collect();
        effects.push(Effect::FetchRoster {
            conversation,
            epoch: self.epoch,
        });
        effects
    }

    /// A keystroke in the active conversation's input.
    pub fn start_input(&mut self) {
        let Some(conversation) = self.rooms.active().cloned() else {
            return;
        };
        let now = self.clock.now();
        for event in self.typing.keystroke(&conversation, now) {
            self.emit(event);
        }
    }

    /// The input lost focus: stop composing now.
    pub fn stop_input(&mut self) {
        if let Some(stop) = self.typing.stop_input() {
            self.emit(stop);
        }
    }

    /// Validate, stop typing, then send. Nothing is emitted if validation
    /// fails.
    pub fn send(
        &mut self,
        text: Option<&str>,
        attachment: Option<Attachment>,
    ) -> Result<SendReceipt, ValidationError> {
        let (event, client_ref) =
            self.composer
                .prepare(self.rooms.active(), text, attachment.as_ref())?;
        if let Some(stop) = self.typing.stop_input() {
            self.emit(stop);
        }
        let emitted = self.connection.emit(event);
        self.composer.clear_draft();
        debug!(%client_ref, emitted, "Sent message");
        Ok(SendReceipt {
            client_ref,
            emitted,
        })
    }

    pub fn stage_attachment(&mut self, attachment: Attachment) -> Result<(), ValidationError> {
        self.composer.stage_attachment(attachment)
    }

    pub fn clear_attachment(&mut self) {
        self.composer.clear_attachment();
    }

    pub fn refresh_conversations(&self) -> Vec<Effect> {
        if self.connection.session().is_none() {
            return Vec::new();
        }
        vec![Effect::FetchConversations { epoch: self.epoch }]
    }

    pub fn apply_fetch(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Backlog { ticket, result } => {
                self.cache.apply_backlog(&ticket, result);
            }
            FetchOutcome::Roster {
                conversation,
                epoch,
                result,
            } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(members) => {
                        self.rosters.insert(conversation, members);
                        self.refresh_counterparties();
                    }
                    Err(e) => warn!(%conversation, error = %e, "Roster fetch failed"),
                }
            }
            FetchOutcome::Conversations { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(list) => {
                        debug!(count = list.len(), "Conversation list updated");
                        self.conversations = Arc::new(list);
                        self.refresh_counterparties();
                    }
                    Err(e) => warn!(error = %e, "Conversation list fetch failed"),
                }
            }
        }
    }

    fn refresh_counterparties(&mut self) {
        let direct = self
            .conversations
            .iter()
            .filter_map(|c| c.counterpart_id.clone());
        let members = self.rosters.values().flatten().map(|m| m.id.clone());
        let all: BTreeSet<UserId> = direct.chain(members).collect();
        if self.presence.set_counterparties(all) && self.connection.is_connected() {
            if let Some(query) = self.presence.query() {
                self.emit(query);
            }
        }
    }

    /// Fire due typing timers.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        let (stop, _) = self.typing.expire(now);
        if let Some(stop) = stop {
            self.emit(stop);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing.next_deadline()
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn view(&self) -> ConversationView {
        let active = self.rooms.active().cloned();
        let (messages, status) = match &active {
            Some(conversation) => {
                let snapshot = self.cache.snapshot(conversation);
                (snapshot.messages, snapshot.status)
            }
            None => {
                let snapshot = ConversationView::default();
                (snapshot.messages, snapshot.status)
            }
        };
        ConversationView {
            online: active
                .as_ref()
                .is_some_and(|c| self.counterpart_online(c)),
            joined: active.is_some() && self.rooms.joined() == active.as_ref(),
            conversation_id: active,
            messages,
            status,
            typing: self.typing.label(),
            connection: self.connection.state(),
            online_users: self.presence.online(),
            conversations: Arc::clone(&self.conversations),
            last_error: self.last_error.clone(),
        }
    }

    fn counterpart_online(&self, conversation: &ConversationId) -> bool {
        let local = self.connection.session().map(|s| &s.user_id);
        if let Some(members) = self.rosters.get(conversation) {
            return members
                .iter()
                .any(|m| Some(&m.id) != local && self.presence.is_online(&m.id));
        }
        self.conversations
            .iter()
            .find(|c| &c.id == conversation)
            .and_then(|c| c.counterpart_id.as_ref())
            .is_some_and(|id| self.presence.is_online(id))
    }

    /// Stop composing and close the connection.
    pub fn shutdown(&mut self) {
        self.stop_input();
        self.connection.shutdown();
    }

    fn emit(&self, event: ClientEvent) {
        self.connection.emit(event);
    }
}
