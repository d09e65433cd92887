//! Presence Tracker
//!
//! Owns the client-wide online set. Presence is polled with one batched query
//! per trigger (connect, counterparty change) and each response replaces the
//! set wholesale. The local user is always online while connected.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::model::UserId;
use crate::protocol::ClientEvent;

#[derive(Debug, Default)]
pub struct PresenceTracker {
    local: Option<UserId>,
    online: Arc<BTreeSet<UserId>>,
    counterparties: BTreeSet<UserId>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local identity. Clears everything learned for the previous one.
    pub fn set_local_user(&mut self, user: Option<UserId>) {
        self.counterparties.clear();
        self.online = Arc::new(user.iter().cloned().collect());
        self.local = user;
    }

    /// Replace the counterparty set. Returns true if it changed.
    pub fn set_counterparties(&mut self, users: impl IntoIterator<Item = UserId>) -> bool {
        let next: BTreeSet<UserId> = users
            .into_iter()
            .filter(|u| Some(u) != self.local.as_ref())
            .collect();
        if next == self.counterparties {
            return false;
        }
        self.counterparties = next;
        true
    }

    /// The batched query for every known counterparty, or `None` when there
    /// is nobody to ask about.
    pub fn query(&self) -> Option<ClientEvent> {
        if self.counterparties.is_empty() {
            return None;
        }
        debug!(count = self.counterparties.len(), "Querying presence");
        Some(ClientEvent::CheckOnlineStatus {
            user_ids: self.counterparties.iter().cloned().collect(),
        })
    }

    /// Full replacement: users missing from the response are offline.
    pub fn on_response(&mut self, user_ids: Vec<UserId>) -> bool {
        let next: BTreeSet<UserId> = self.local.iter().cloned().chain(user_ids).collect();
        self.replace(next)
    }

    /// Incremental update pushed by the server.
    pub fn on_presence_changed(&mut self, user: UserId, online: bool) -> bool {
        if Some(&user) == self.local.as_ref() {
            return false;
        }
        if online == self.online.contains(&user) {
            return false;
        }
        let set = Arc::make_mut(&mut self.online);
        if online {
            set.insert(user);
        } else {
            set.remove(&user);
        }
        true
    }

    /// Remote presence is unknown until the next query; keep only ourselves.
    pub fn on_disconnected(&mut self) -> bool {
        let next: BTreeSet<UserId> = self.local.iter().cloned().collect();
        self.replace(next)
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    pub fn online(&self) -> Arc<BTreeSet<UserId>> {
        Arc::clone(&self.online)
    }

    fn replace(&mut self, next: BTreeSet<UserId>) -> bool {
        if *self.online == next {
            return false;
        }
        self.online = Arc::new(next);
        true
    }
}
