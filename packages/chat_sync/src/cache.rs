//! Message Stream Cache
//!
//! One append-only log per conversation, seeded once from the REST backlog and
//! then extended by pushed messages. Logs are unique by message id.
//!
//! A push can beat the first backlog response. Those pushes are held back and
//! merged behind the backlog once it lands, deduplicated on id. A conversation
//! nobody has loaded never gets a log from pushes alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::FetchError;
use crate::model::{ConversationId, Message, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    NotLoaded,
    Loading,
    Ready,
    /// The first backlog fetch failed; `load` again to retry.
    Failed(String),
}

/// Identifies one backlog request. Responses are applied through the ticket,
/// so a response lands in the log it was requested for no matter what is
/// active when it resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation: ConversationId,
    epoch: u64,
}

/// Point-in-time copy of one conversation's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSnapshot {
    pub messages: Arc<Vec<Message>>,
    pub status: LoadStatus,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub snapshot: LogSnapshot,
    /// Set when the caller should fetch the backlog and hand the result to
    /// [`MessageCache::apply_backlog`].
    pub fetch: Option<LoadTicket>,
}

#[derive(Debug)]
struct ConversationLog {
    messages: Arc<Vec<Message>>,
    ids: HashSet<MessageId>,
    seeded: bool,
    status: LoadStatus,
    in_flight: bool,
    early: Vec<Message>,
}

impl ConversationLog {
    fn new() -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            ids: HashSet::new(),
            seeded: false,
            status: LoadStatus::NotLoaded,
            in_flight: false,
            early: Vec::new(),
        }
    }

    fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        Arc::make_mut(&mut self.messages).push(message);
        true
    }

    fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            messages: Arc::clone(&self.messages),
            status: self.status.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageCache {
    logs: HashMap<ConversationId, ConversationLog>,
    epoch: u64,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot, plus a ticket when a fetch should start.
    ///
    /// An unseeded conversation moves to `Loading`; a seeded one stays `Ready`
    /// and the fetch acts as a background refresh. No second fetch is issued
    /// while one is outstanding.
    pub fn load(&mut self, conversation: &ConversationId) -> LoadOutcome {
        let log = self
            .logs
            .entry(conversation.clone())
            .or_insert_with(ConversationLog::new);

        if log.in_flight {
            return LoadOutcome {
                snapshot: log.snapshot(),
                fetch: None,
            };
        }

        log.in_flight = true;
        if !log.seeded {
            log.status = LoadStatus::Loading;
        }
        LoadOutcome {
            snapshot: log.snapshot(),
            fetch: Some(LoadTicket {
                conversation: conversation.clone(),
                epoch: self.epoch,
            }),
        }
    }

    /// Apply a backlog response. Returns false if the ticket predates the
    /// last [`clear`](Self::clear).
    pub fn apply_backlog(
        &mut self,
        ticket: &LoadTicket,
        result: Result<Vec<Message>, FetchError>,
    ) -> bool {
        if ticket.epoch != self.epoch {
            debug!(conversation = %ticket.conversation, "Dropping backlog from a previous session");
            return false;
        }
        let Some(log) = self.logs.get_mut(&ticket.conversation) else {
            return false;
        };
        log.in_flight = false;

        match result {
            Ok(backlog) => {
                let count = backlog.len();
                // Server order first, then whatever was pushed that the
                // server did not return.
                let previous = std::mem::replace(&mut log.messages, Arc::new(Vec::new()));
                log.ids.clear();
                let mut skipped = 0;
                for message in backlog {
                    if message.conversation_id != ticket.conversation {
                        warn!(
                            conversation = %ticket.conversation,
                            message = %message.id,
                            "Backlog returned a message for another conversation"
                        );
                        continue;
                    }
                    if !log.append(message) {
                        skipped += 1;
                    }
                }
                let pushed = previous
                    .iter()
                    .cloned()
                    .chain(std::mem::take(&mut log.early));
                let mut retained = 0;
                for message in pushed {
                    if log.append(message) {
                        retained += 1;
                    }
                }
                log.seeded = true;
                log.status = LoadStatus::Ready;
                debug!(
                    conversation = %ticket.conversation,
                    count,
                    skipped,
                    retained,
                    total = log.messages.len(),
                    "Applied backlog"
                );
            }
            Err(e) if log.seeded => {
                warn!(conversation = %ticket.conversation, error = %e, "Backlog refresh failed");
            }
            Err(e) => {
                warn!(conversation = %ticket.conversation, error = %e, "Backlog fetch failed");
                log.early.clear();
                log.status = LoadStatus::Failed(e.to_string());
            }
        }
        true
    }

    /// Append a pushed message. Pushes that arrive while the first backlog
    /// is in flight are held until it lands; anything else for an unseeded
    /// conversation is dropped.
    pub fn on_push(&mut self, message: Message) {
        let conversation = message.conversation_id.clone();
        let Some(log) = self.logs.get_mut(&conversation) else {
            debug!(%conversation, message = %message.id, "Dropping push for unseeded conversation");
            return;
        };

        if !log.seeded {
            if !log.in_flight {
                debug!(%conversation, message = %message.id, "Dropping push for unseeded conversation");
            } else if log.early.iter().all(|m| m.id != message.id) {
                log.early.push(message);
            }
            return;
        }

        let id = message.id.clone();
        if !log.append(message) {
            debug!(%conversation, message = %id, "Ignoring duplicate message");
        }
    }

    pub fn snapshot(&self, conversation: &ConversationId) -> LogSnapshot {
        self.logs
            .get(conversation)
            .map(ConversationLog::snapshot)
            .unwrap_or_else(|| LogSnapshot {
                messages: Arc::new(Vec::new()),
                status: LoadStatus::NotLoaded,
            })
    }

    /// Forget every log. Outstanding tickets become stale.
    pub fn clear(&mut self) {
        self.logs.clear();
        self.epoch += 1;
    }
}
