//! Duplex Event Channel
//!
//! The core talks to the server through [`EventChannel`], an event-based
//! duplex channel (connect/disconnect, emit, subscribe). Transports implement
//! it; [`EventHub`] gives them handler bookkeeping for free.
//!
//! Subscriptions are handles: dropping a [`Subscription`] unregisters it, so
//! tearing down a connection cannot leak handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ChannelError;
use crate::model::Session;
use crate::protocol::{ClientEvent, EventKind, Inbound};

pub trait EventChannel: Send + Sync {
    /// Start connecting. Completion is reported as [`Inbound::Connected`];
    /// failures as [`Inbound::Disconnected`]. Retrying is the channel's job.
    fn connect(&self);

    /// Stop the channel and any reconnect attempts.
    fn disconnect(&self);

    fn emit(&self, event: ClientEvent) -> Result<(), ChannelError>;

    fn subscribe(&self, kinds: &[EventKind]) -> Subscription;
}

/// Opens one channel per session.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, session: &Session) -> Arc<dyn EventChannel>;
}

struct Handler {
    kinds: Vec<EventKind>,
    tx: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    handlers: HashMap<u64, Handler>,
}

/// Registry of subscriptions for one channel.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handlers.insert(
            id,
            Handler {
                kinds: kinds.to_vec(),
                tx,
            },
        );
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an inbound event to every interested subscription.
    /// Returns the number of subscriptions that received it.
    pub fn dispatch(&self, event: Inbound) -> usize {
        let kind = event.kind();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        inner.handlers.retain(|_, handler| {
            if !handler.kinds.contains(&kind) {
                return true;
            }
            if handler.tx.send(event.clone()).is_err() {
                return false;
            }
            delivered += 1;
            true
        });
        trace!(?kind, delivered, "Dispatched inbound event");
        delivered
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    /// Drop every registration; pending subscriptions see end-of-stream.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .clear();
    }
}

/// A live registration on an [`EventHub`]. Unregisters on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Inbound>,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    /// Next event, or `None` once the hub has released this subscription.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handlers
                .remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
