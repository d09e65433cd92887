//! Connection Lifecycle
//!
//! Keeps exactly one channel alive while a session is present and none
//! otherwise. Reconnects are the transport's business; this module only
//! tracks the signals it reports.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{ChannelFactory, EventChannel, Subscription};
use crate::model::Session;
use crate::protocol::{ClientEvent, EventKind, Inbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a session update did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    Unchanged,
    Opened,
    Closed,
    /// Old connection torn down, new one opened for a different identity
    Replaced,
    /// Same user with new credentials: the channel was reopened
    Reopened,
}

struct ActiveConnection {
    session: Session,
    channel: Arc<dyn EventChannel>,
    subscription: Subscription,
    state: ConnectionState,
    /// The channel released our subscription; nothing more will arrive.
    closed: bool,
}

pub struct ConnectionManager {
    factory: Arc<dyn ChannelFactory>,
    active: Option<ActiveConnection>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            active: None,
        }
    }

    /// Reconcile the connection with the current session value.
    pub fn set_session(&mut self, session: Option<&Session>) -> SessionTransition {
        let current = self.active.as_ref().map(|a| &a.session);
        match (current, session) {
            (None, None) => SessionTransition::Unchanged,
            (Some(cur), Some(new)) if cur == new => SessionTransition::Unchanged,
            (Some(cur), Some(new)) if cur.user_id == new.user_id => {
                self.teardown();
                self.open(new);
                SessionTransition::Reopened
            }
            (None, Some(new)) => {
                self.open(new);
                SessionTransition::Opened
            }
            (Some(_), None) => {
                self.teardown();
                SessionTransition::Closed
            }
            (Some(_), Some(new)) => {
                // Handlers of the old connection are released before the new one exists.
                self.teardown();
                self.open(new);
                SessionTransition::Replaced
            }
        }
    }

    fn open(&mut self, session: &Session) {
        info!(user = %session.user_id, "Opening connection");
        let channel = self.factory.open(session);
        let subscription = channel.subscribe(EventKind::ALL);
        channel.connect();
        self.active = Some(ActiveConnection {
            session: session.clone(),
            channel,
            subscription,
            state: ConnectionState::Connecting,
            closed: false,
        });
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            info!(user = %active.session.user_id, "Closing connection");
            drop(active.subscription);
            active.channel.disconnect();
        }
    }

    /// Returns true when this signal moved the state to Connected.
    pub fn mark_connected(&mut self) -> bool {
        match self.active.as_mut() {
            Some(active) if active.state != ConnectionState::Connected => {
                info!(user = %active.session.user_id, "Connected");
                active.state = ConnectionState::Connected;
                true
            }
            _ => false,
        }
    }

    /// Returns true when this signal moved the state away from Connected.
    pub fn mark_disconnected(&mut self, reason: &str) -> bool {
        match self.active.as_mut() {
            Some(active) => {
                let was_connected = active.state == ConnectionState::Connected;
                if was_connected {
                    info!(user = %active.session.user_id, reason, "Disconnected");
                } else {
                    debug!(user = %active.session.user_id, reason, "Connect attempt failed");
                }
                active.state = ConnectionState::Disconnected;
                was_connected
            }
            None => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.active
            .as_ref()
            .map(|a| a.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    /// Emit on the live channel. Failures are logged, never propagated.
    /// Returns whether the channel accepted the event.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let Some(active) = self.active.as_ref() else {
            debug!(?event, "No connection, dropping outbound event");
            return false;
        };
        if active.state != ConnectionState::Connected {
            debug!(?event, "Not connected, dropping outbound event");
            return false;
        }
        match active.channel.emit(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to emit event");
                false
            }
        }
    }

    /// Next inbound event from the live connection. Never resolves while no
    /// connection exists. A channel that drops our subscription is reported
    /// once as a disconnect.
    pub async fn recv(&mut self) -> Inbound {
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        if active.closed {
            return std::future::pending().await;
        }
        match active.subscription.recv().await {
            Some(event) => event,
            None => {
                warn!(user = %active.session.user_id, "Channel released its subscriptions");
                active.closed = true;
                Inbound::Disconnected {
                    reason: "channel closed".to_string(),
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.teardown();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
