//! Error types for the sync core.

/// Rejections raised synchronously to the caller of `send`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message has neither text nor an attachment")]
    EmptyMessage,

    #[error("attachment is {size} bytes, the limit is {max} bytes")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("no conversation is active")]
    NoActiveConversation,
}

/// Failures of the duplex event channel. Always absorbed by the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is closed")]
    Closed,

    #[error("outbound queue is full")]
    Backpressure,

    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// Failures of the history (REST) collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{message} (status {status})")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Errors surfaced through [`crate::SyncHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("sync client has shut down")]
    ClientClosed,
}
