//! Typing Indicator Engine
//!
//! Two independent state machines driven by an external clock:
//!
//! - [`LocalComposer`] turns keystrokes into at most one start/stop pair per
//!   inactivity window.
//! - [`RemoteTypers`] aggregates other users' start/stop signals for the
//!   active conversation, with its own ceiling in case a stop is lost.
//!
//! Neither owns a timer. Callers ask for the next deadline, sleep until then,
//! and call `expire(now)`.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::model::{ConversationId, Member, UserId};
use crate::protocol::ClientEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalState {
    Idle,
    Composing {
        conversation: ConversationId,
        deadline: Instant,
    },
}

#[derive(Debug)]
pub struct LocalComposer {
    window: Duration,
    state: LocalState,
}

impl LocalComposer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: LocalState::Idle,
        }
    }

    /// Register a keystroke. The first one after Idle emits a start; later
    /// ones only push the deadline back.
    pub fn keystroke(&mut self, conversation: &ConversationId, now: Instant) -> Vec<ClientEvent> {
        let deadline = now + self.window;
        match &mut self.state {
            LocalState::Composing {
                conversation: current,
                deadline: d,
            } if current == conversation => {
                *d = deadline;
                Vec::new()
            }
            LocalState::Composing {
                conversation: previous,
                ..
            } => {
                let stop = ClientEvent::StopTyping {
                    conversation_id: previous.clone(),
                };
                self.state = LocalState::Composing {
                    conversation: conversation.clone(),
                    deadline,
                };
                vec![
                    stop,
                    ClientEvent::StartTyping {
                        conversation_id: conversation.clone(),
                    },
                ]
            }
            LocalState::Idle => {
                self.state = LocalState::Composing {
                    conversation: conversation.clone(),
                    deadline,
                };
                vec![ClientEvent::StartTyping {
                    conversation_id: conversation.clone(),
                }]
            }
        }
    }

    /// Emit the stop once the inactivity window has elapsed.
    pub fn expire(&mut self, now: Instant) -> Option<ClientEvent> {
        match &self.state {
            LocalState::Composing { deadline, .. } if now >= *deadline => self.force_stop(),
            _ => None,
        }
    }

    /// Back to Idle right now, emitting a stop if composing.
    pub fn force_stop(&mut self) -> Option<ClientEvent> {
        match std::mem::replace(&mut self.state, LocalState::Idle) {
            LocalState::Composing { conversation, .. } => Some(ClientEvent::StopTyping {
                conversation_id: conversation,
            }),
            LocalState::Idle => None,
        }
    }

    /// Back to Idle without emitting anything.
    pub fn reset(&mut self) {
        self.state = LocalState::Idle;
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            LocalState::Composing { deadline, .. } => Some(*deadline),
            LocalState::Idle => None,
        }
    }
}

/// What the presentation layer shows under the message list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypingLabel {
    #[default]
    Nobody,
    One(String),
    Several(usize),
}

impl TypingLabel {
    pub fn render(&self) -> Option<String> {
        match self {
            TypingLabel::Nobody => None,
            TypingLabel::One(name) => Some(format!("{name} is typing…")),
            TypingLabel::Several(_) => Some("Several people are typing…".to_string()),
        }
    }
}

#[derive(Debug)]
pub struct RemoteTypers {
    ceiling: Duration,
    conversation: Option<ConversationId>,
    typers: Vec<(Member, Instant)>,
}

impl RemoteTypers {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            conversation: None,
            typers: Vec::new(),
        }
    }

    /// Scope the aggregator to a conversation, dropping everything tracked.
    pub fn reset(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.typers.clear();
    }

    /// Forget all typers but keep the conversation scope.
    pub fn clear(&mut self) -> bool {
        let changed = !self.typers.is_empty();
        self.typers.clear();
        changed
    }

    pub fn on_started(&mut self, conversation: &ConversationId, member: Member, now: Instant) -> bool {
        if self.conversation.as_ref() != Some(conversation) {
            return false;
        }
        if self.typers.iter().any(|(m, _)| m.id == member.id) {
            return false;
        }
        debug!(%conversation, user = %member.id, "Remote user started typing");
        self.typers.push((member, now + self.ceiling));
        true
    }

    pub fn on_stopped(&mut self, conversation: &ConversationId, user: &UserId) -> bool {
        if self.conversation.as_ref() != Some(conversation) {
            return false;
        }
        let before = self.typers.len();
        self.typers.retain(|(m, _)| &m.id != user);
        before != self.typers.len()
    }

    /// Drop typers whose ceiling has passed. Returns true if any were dropped.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.typers.len();
        self.typers.retain(|(member, expires_at)| {
            let keep = now < *expires_at;
            if !keep {
                debug!(user = %member.id, "Remote typer expired without a stop");
            }
            keep
        });
        before != self.typers.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.typers.iter().map(|(_, at)| *at).min()
    }

    pub fn label(&self) -> TypingLabel {
        match self.typers.as_slice() {
            [] => TypingLabel::Nobody,
            [(member, _)] => TypingLabel::One(member.display_name.clone()),
            many => TypingLabel::Several(many.len()),
        }
    }
}

/// Both directions of typing state, scoped to the active conversation.
#[derive(Debug)]
pub struct TypingEngine {
    local_user: Option<UserId>,
    local: LocalComposer,
    remote: RemoteTypers,
}

impl TypingEngine {
    pub fn new(window: Duration, ceiling: Duration) -> Self {
        Self {
            local_user: None,
            local: LocalComposer::new(window),
            remote: RemoteTypers::new(ceiling),
        }
    }

    pub fn set_local_user(&mut self, user: Option<UserId>) {
        self.local_user = user;
    }

    pub fn keystroke(&mut self, conversation: &ConversationId, now: Instant) -> Vec<ClientEvent> {
        self.local.keystroke(conversation, now)
    }

    pub fn stop_input(&mut self) -> Option<ClientEvent> {
        self.local.force_stop()
    }

    /// Switch conversations: stop composing in the old one and forget its
    /// remote typers.
    pub fn switch(&mut self, conversation: Option<ConversationId>) -> Option<ClientEvent> {
        let stop = self.local.force_stop();
        self.remote.reset(conversation);
        stop
    }

    /// The connection dropped. Nothing is emitted; typing state from before
    /// the drop is not carried over.
    pub fn on_disconnected(&mut self) -> bool {
        self.local.reset();
        self.remote.clear()
    }

    pub fn on_remote_started(
        &mut self,
        conversation: &ConversationId,
        member: Member,
        now: Instant,
    ) -> bool {
        if self.local_user.as_ref() == Some(&member.id) {
            return false;
        }
        self.remote.on_started(conversation, member, now)
    }

    pub fn on_remote_stopped(&mut self, conversation: &ConversationId, user: &UserId) -> bool {
        self.remote.on_stopped(conversation, user)
    }

    /// Returns the local stop to emit, if due, and whether the remote label
    /// changed.
    pub fn expire(&mut self, now: Instant) -> (Option<ClientEvent>, bool) {
        (self.local.expire(now), self.remote.expire(now))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.local.deadline(), self.remote.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn label(&self) -> TypingLabel {
        self.remote.label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    const WINDOW: Duration = Duration::from_secs(3);
    const CEILING: Duration = Duration::from_secs(10);

    fn start(conv: &str) -> ClientEvent {
        ClientEvent::StartTyping {
            conversation_id: conv.into(),
        }
    }

    fn stop(conv: &str) -> ClientEvent {
        ClientEvent::StopTyping {
            conversation_id: conv.into(),
        }
    }

    #[test]
    fn burst_emits_one_start_and_one_stop() {
        let clock = ManualClock::new();
        let mut local = LocalComposer::new(WINDOW);
        let conv = ConversationId::from("a");
        let mut emitted = Vec::new();

        for _ in 0..20 {
            emitted.extend(local.keystroke(&conv, clock.now()));
            clock.advance(Duration::from_millis(100));
            emitted.extend(local.expire(clock.now()));
        }
        assert_eq!(emitted, vec![start("a")]);

        clock.advance(Duration::from_millis(2800));
        assert_eq!(local.expire(clock.now()), None);
        clock.advance(Duration::from_millis(200));
        assert_eq!(local.expire(clock.now()), Some(stop("a")));
        assert_eq!(local.expire(clock.now()), None);
        assert_eq!(local.deadline(), None);
    }

    #[test]
    fn keystroke_pushes_deadline_back() {
        let clock = ManualClock::new();
        let mut local = LocalComposer::new(WINDOW);
        let conv = ConversationId::from("a");

        local.keystroke(&conv, clock.now());
        clock.advance(Duration::from_secs(2));
        local.keystroke(&conv, clock.now());
        clock.advance(Duration::from_secs(2));
        assert_eq!(local.expire(clock.now()), None);
        assert_eq!(local.deadline(), Some(clock.now() + Duration::from_secs(1)));
    }

    #[test]
    fn force_stop_only_when_composing() {
        let clock = ManualClock::new();
        let mut local = LocalComposer::new(WINDOW);
        assert_eq!(local.force_stop(), None);
        local.keystroke(&"a".into(), clock.now());
        assert_eq!(local.force_stop(), Some(stop("a")));
        assert_eq!(local.deadline(), None);
    }

    #[test]
    fn keystroke_in_another_conversation_stops_the_old_one() {
        let clock = ManualClock::new();
        let mut local = LocalComposer::new(WINDOW);
        local.keystroke(&"a".into(), clock.now());
        assert_eq!(
            local.keystroke(&"b".into(), clock.now()),
            vec![stop("a"), start("b")]
        );
    }

    #[test]
    fn remote_start_is_idempotent_and_stop_removes() {
        let clock = ManualClock::new();
        let mut remote = RemoteTypers::new(CEILING);
        let a = ConversationId::from("a");
        remote.reset(Some(a.clone()));

        assert!(remote.on_started(&a, Member::new("u2", "Bob"), clock.now()));
        assert!(!remote.on_started(&a, Member::new("u2", "Bob"), clock.now()));
        assert_eq!(remote.label(), TypingLabel::One("Bob".into()));

        assert!(remote.on_started(&a, Member::new("u3", "Cy"), clock.now()));
        assert_eq!(remote.label(), TypingLabel::Several(2));

        assert!(remote.on_stopped(&a, &"u2".into()));
        assert!(!remote.on_stopped(&a, &"u2".into()));
        assert_eq!(remote.label().render().as_deref(), Some("Cy is typing…"));
    }

    #[test]
    fn remote_events_for_other_conversations_are_ignored() {
        let clock = ManualClock::new();
        let mut remote = RemoteTypers::new(CEILING);
        remote.reset(Some("a".into()));
        assert!(!remote.on_started(&"b".into(), Member::new("u2", "Bob"), clock.now()));
        assert_eq!(remote.label(), TypingLabel::Nobody);
    }

    #[test]
    fn lost_stop_expires_at_ceiling() {
        let clock = ManualClock::new();
        let mut remote = RemoteTypers::new(CEILING);
        let a = ConversationId::from("a");
        remote.reset(Some(a.clone()));
        remote.on_started(&a, Member::new("u2", "Bob"), clock.now());

        clock.advance(CEILING - Duration::from_millis(1));
        assert!(!remote.expire(clock.now()));
        clock.advance(Duration::from_millis(1));
        assert!(remote.expire(clock.now()));
        assert_eq!(remote.label(), TypingLabel::Nobody);
        assert_eq!(remote.next_deadline(), None);
    }

    #[test]
    fn label_rendering() {
        assert_eq!(TypingLabel::Nobody.render(), None);
        assert_eq!(
            TypingLabel::Several(3).render().as_deref(),
            Some("Several people are typing…")
        );
    }

    #[test]
    fn engine_switch_clears_both_directions() {
        let clock = ManualClock::new();
        let mut engine = TypingEngine::new(WINDOW, CEILING);
        let a = ConversationId::from("a");
        engine.switch(Some(a.clone()));
        engine.keystroke(&a, clock.now());
        engine.on_remote_started(&a, Member::new("u2", "Bob"), clock.now());

        assert_eq!(engine.switch(Some("b".into())), Some(stop("a")));
        assert_eq!(engine.label(), TypingLabel::Nobody);
        assert_eq!(engine.next_deadline(), None);

        // Late stop from the old conversation is harmless.
        assert!(!engine.on_remote_stopped(&a, &"u2".into()));
    }

    #[test]
    fn engine_ignores_own_echo() {
        let clock = ManualClock::new();
        let mut engine = TypingEngine::new(WINDOW, CEILING);
        engine.set_local_user(Some("u1".into()));
        engine.switch(Some("a".into()));
        assert!(!engine.on_remote_started(&"a".into(), Member::new("u1", "Me"), clock.now()));
        assert_eq!(engine.label(), TypingLabel::Nobody);
    }

    #[test]
    fn engine_disconnect_drops_state_silently() {
        let clock = ManualClock::new();
        let mut engine = TypingEngine::new(WINDOW, CEILING);
        let a = ConversationId::from("a");
        engine.switch(Some(a.clone()));
        engine.keystroke(&a, clock.now());
        engine.on_remote_started(&a, Member::new("u2", "Bob"), clock.now());

        assert!(engine.on_disconnected());
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.stop_input(), None);
        assert_eq!(engine.label(), TypingLabel::Nobody);

        // Same conversation after reconnect: a keystroke starts fresh.
        assert_eq!(engine.keystroke(&a, clock.now()), vec![start("a")]);
    }

    #[test]
    fn engine_next_deadline_is_earliest() {
        let clock = ManualClock::new();
        let mut engine = TypingEngine::new(WINDOW, CEILING);
        let a = ConversationId::from("a");
        let t0 = clock.now();
        engine.switch(Some(a.clone()));
        engine.on_remote_started(&a, Member::new("u2", "Bob"), t0);
        assert_eq!(engine.next_deadline(), Some(t0 + CEILING));
        engine.keystroke(&a, t0);
        assert_eq!(engine.next_deadline(), Some(t0 + WINDOW));
    }
}
