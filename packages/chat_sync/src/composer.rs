//! Outbound Composer
//!
//! Validates a send request and packages it as a single `send_message` event.
//! The composer never touches the message cache: a sent message only appears
//! once the server echoes it back.

use tracing::debug;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::{Attachment, ConversationId};
use crate::protocol::ClientEvent;

/// Result of an accepted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub client_ref: Uuid,
    /// False when the channel was down and the event was dropped.
    pub emitted: bool,
}

#[derive(Debug)]
pub struct Composer {
    max_attachment_bytes: usize,
    staged: Option<Attachment>,
}

impl Composer {
    pub fn new(max_attachment_bytes: usize) -> Self {
        Self {
            max_attachment_bytes,
            staged: None,
        }
    }

    /// Stage an attachment for the next send, checking the size cap now.
    pub fn stage_attachment(&mut self, attachment: Attachment) -> Result<(), ValidationError> {
        self.check_size(&attachment)?;
        debug!(?attachment, "Staged attachment");
        self.staged = Some(attachment);
        Ok(())
    }

    pub fn clear_attachment(&mut self) {
        self.staged = None;
    }

    /// Validate and build the send event. An explicit attachment wins over a
    /// staged one. Nothing is cleared here; call [`clear_draft`](Self::clear_draft)
    /// after the event is handed to the channel.
    pub fn prepare(
        &self,
        conversation: Option<&ConversationId>,
        text: Option<&str>,
        attachment: Option<&Attachment>,
    ) -> Result<(ClientEvent, Uuid), ValidationError> {
        let text = text.map(str::trim).filter(|t| !t.is_empty());
        let attachment = attachment
            .or(self.staged.as_ref())
            .filter(|a| !a.is_empty());

        if text.is_none() && attachment.is_none() {
            return Err(ValidationError::EmptyMessage);
        }
        if let Some(attachment) = attachment {
            self.check_size(attachment)?;
        }
        let conversation = conversation.ok_or(ValidationError::NoActiveConversation)?;

        let client_ref = Uuid::new_v4();
        let event = ClientEvent::SendMessage {
            conversation_id: conversation.clone(),
            text_content: text.map(str::to_string),
            image_data_url: attachment.map(Attachment::to_data_url),
            client_ref,
        };
        Ok((event, client_ref))
    }

    pub fn clear_draft(&mut self) {
        self.staged = None;
    }

    fn check_size(&self, attachment: &Attachment) -> Result<(), ValidationError> {
        if attachment.len() > self.max_attachment_bytes {
            return Err(ValidationError::AttachmentTooLarge {
                size: attachment.len(),
                max: self.max_attachment_bytes,
            });
        }
        Ok(())
    }
}
