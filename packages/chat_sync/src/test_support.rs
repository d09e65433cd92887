//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use tokio::sync::Notify;

use crate::channel::{ChannelFactory, EventChannel, EventHub, Subscription};
use crate::error::{ChannelError, FetchError};
use crate::history::HistoryFetcher;
use crate::model::{
    ConversationId, ConversationKind, ConversationSummary, Member, Message, Session,
};
use crate::protocol::{ClientEvent, EventKind, Inbound};

pub fn message(id: &str, conversation: &str) -> Message {
    Message {
        id: id.into(),
        conversation_id: conversation.into(),
        sender_id: "u2".into(),
        sender_display_name: "Bob".into(),
        sender_avatar: None,
        text_content: Some(format!("text of {id}")),
        attachment: None,
        created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

pub fn direct(id: &str, counterpart: &str, name: &str) -> ConversationSummary {
    ConversationSummary {
        id: id.into(),
        kind: ConversationKind::Direct,
        group_name: None,
        counterpart_id: Some(counterpart.into()),
        counterpart_name: Some(name.into()),
        last_message_content: None,
        last_message_at: None,
        unread_count: 0,
    }
}

/// Records emits and lets tests push inbound events.
#[derive(Default)]
pub struct RecordingChannel {
    hub: EventHub,
    emitted: Mutex<Vec<ClientEvent>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingChannel {
    pub fn inject(&self, event: Inbound) -> usize {
        self.hub.dispatch(event)
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn take_emitted(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.emitted.lock().unwrap())
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.hub.handler_count()
    }

    pub fn release_handlers(&self) {
        self.hub.clear();
    }

    pub fn fail_emits(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.connect_calls() > self.disconnect_calls()
    }
}

impl EventChannel for RecordingChannel {
    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ChannelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.emitted.lock().unwrap().push(event);
        Ok(())
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.hub.subscribe(kinds)
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    channels: Mutex<Vec<Arc<RecordingChannel>>>,
    sessions: Mutex<Vec<Session>>,
    live_at_open: Mutex<Vec<usize>>,
}

impl RecordingFactory {
    pub fn latest(&self) -> Option<Arc<RecordingChannel>> {
        self.channels.lock().unwrap().last().cloned()
    }

    pub fn opened_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().clone()
    }

    /// How many earlier channels were still live each time one was opened.
    pub fn live_at_open(&self) -> Vec<usize> {
        self.live_at_open.lock().unwrap().clone()
    }
}

impl ChannelFactory for RecordingFactory {
    fn open(&self, session: &Session) -> Arc<dyn EventChannel> {
        let mut channels = self.channels.lock().unwrap();
        let live = channels.iter().filter(|c| c.is_live()).count();
        self.live_at_open.lock().unwrap().push(live);
        self.sessions.lock().unwrap().push(session.clone());
        let channel = Arc::new(RecordingChannel::default());
        channels.push(channel.clone());
        channel
    }
}

/// Scripted history with optional gates that hold a backlog response until
/// the test releases it.
#[derive(Default)]
pub struct StaticHistory {
    backlogs: Mutex<HashMap<ConversationId, Result<Vec<Message>, FetchError>>>,
    rosters: Mutex<HashMap<ConversationId, Vec<Member>>>,
    conversations: Mutex<Vec<ConversationSummary>>,
    gates: Mutex<HashMap<ConversationId, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl StaticHistory {
    pub fn with_backlog(self, conversation: &str, messages: Vec<Message>) -> Self {
        self.backlogs
            .lock()
            .unwrap()
            .insert(conversation.into(), Ok(messages));
        self
    }

    pub fn with_failing_backlog(self, conversation: &str, error: FetchError) -> Self {
        self.backlogs
            .lock()
            .unwrap()
            .insert(conversation.into(), Err(error));
        self
    }

    pub fn with_roster(self, conversation: &str, members: Vec<Member>) -> Self {
        self.rosters
            .lock()
            .unwrap()
            .insert(conversation.into(), members);
        self
    }

    pub fn with_conversations(self, list: Vec<ConversationSummary>) -> Self {
        *self.conversations.lock().unwrap() = list;
        self
    }

    pub fn set_backlog(&self, conversation: &str, messages: Vec<Message>) {
        self.backlogs
            .lock()
            .unwrap()
            .insert(conversation.into(), Ok(messages));
    }

    /// Hold backlog responses for `conversation` until the returned gate is
    /// notified (one response per `notify_one`).
    pub fn gate(&self, conversation: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(conversation.into(), gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl HistoryFetcher for StaticHistory {
    async fn fetch_backlog(&self, conversation: &ConversationId) -> Result<Vec<Message>, FetchError> {
        self.record(format!("backlog:{conversation}"));
        let gate = self.gates.lock().unwrap().get(conversation).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.backlogs
            .lock()
            .unwrap()
            .get(conversation)
            .cloned()
            .unwrap_or(Ok(Vec::new()))
    }

    async fn fetch_roster(&self, conversation: &ConversationId) -> Result<Vec<Member>, FetchError> {
        self.record(format!("roster:{conversation}"));
        Ok(self
            .rosters
            .lock()
            .unwrap()
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, FetchError> {
        self.record("conversations".to_string());
        Ok(self.conversations.lock().unwrap().clone())
    }
}
