//! Real-time synchronization core for a chat client.
//!
//! The core owns one duplex connection per session, keeps a deduplicated
//! message log per conversation, and tracks typing and presence signals.
//! Presentation layers drive it through a [`SyncHandle`] and read back a
//! [`ConversationView`].
//!
//! Transports and the REST history client are supplied from outside through
//! the [`EventChannel`]/[`ChannelFactory`] and [`HistoryFetcher`] traits.

pub mod cache;
pub mod channel;
pub mod client;
pub mod clock;
pub mod composer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod typing;
pub mod view;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{LoadStatus, LogSnapshot, MessageCache};
pub use channel::{ChannelFactory, EventChannel, EventHub, Subscription};
pub use client::{SyncClient, SyncHandle};
pub use clock::{Clock, ManualClock, RuntimeClock};
pub use composer::SendReceipt;
pub use config::{MAX_ATTACHMENT_BYTES, SyncConfig};
pub use connection::ConnectionState;
pub use engine::{Effect, FetchOutcome, SyncCore};
pub use error::{ChannelError, FetchError, SyncError, ValidationError};
pub use history::HistoryFetcher;
pub use model::{
    Attachment, ConversationId, ConversationKind, ConversationSummary, Member, Message, MessageId,
    Session, UserId,
};
pub use protocol::{ClientEvent, EventKind, Inbound, ServerEvent, UserRef};
pub use typing::TypingLabel;
pub use view::ConversationView;
