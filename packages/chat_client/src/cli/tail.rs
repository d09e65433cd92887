//! Line-oriented rendering for `chat tail`.

use anyhow::{Context, Result};
use chat_sync::{
    Attachment, ConnectionState, ConversationId, ConversationView, LoadStatus, Message,
};
use std::path::{Path, PathBuf};

/// One line typed on stdin.
#[derive(Debug, PartialEq, Eq)]
pub enum InputLine {
    Empty,
    Quit,
    /// `/attach <path>` stages a file for the next send
    Attach(PathBuf),
    /// `/detach` drops the staged file
    Detach,
    /// Plain text, or `/send` on its own to send only the staged file
    Send(Option<String>),
}

pub fn parse_line(line: &str) -> InputLine {
    let trimmed = line.trim();
    match trimmed.split_once(' ') {
        _ if trimmed.is_empty() => InputLine::Empty,
        _ if trimmed == "/quit" => InputLine::Quit,
        _ if trimmed == "/detach" => InputLine::Detach,
        _ if trimmed == "/send" => InputLine::Send(None),
        Some(("/attach", path)) if !path.trim().is_empty() => {
            InputLine::Attach(PathBuf::from(path.trim()))
        }
        _ => InputLine::Send(Some(line.to_string())),
    }
}

pub fn load_attachment(path: &Path) -> Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(Attachment::new(mime.essence_str(), bytes))
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn format_message(message: &Message) -> String {
    let mut line = format!(
        "[{}] {}:",
        message.created_at.format("%H:%M"),
        message.sender_display_name
    );
    if let Some(text) = &message.text_content {
        line.push(' ');
        line.push_str(text);
    }
    if message.attachment.is_some() {
        line.push_str(" [attachment]");
    }
    line
}

/// Turns successive views into the lines that changed since the last one.
#[derive(Default)]
pub struct ViewPrinter {
    conversation: Option<ConversationId>,
    printed: usize,
    connection: Option<ConnectionState>,
    status: Option<LoadStatus>,
    joined: bool,
    typing: Option<String>,
    online: Option<bool>,
    last_error: Option<String>,
}

impl ViewPrinter {
    pub fn render(&mut self, view: &ConversationView) -> Vec<String> {
        let mut out = Vec::new();

        if self.connection != Some(view.connection) {
            self.connection = Some(view.connection);
            let label = match view.connection {
                ConnectionState::Connected => "connected",
                ConnectionState::Connecting => "connecting…",
                ConnectionState::Disconnected => "disconnected",
            };
            out.push(format!("-- {label} --"));
        }

        if self.conversation != view.conversation_id {
            self.conversation = view.conversation_id.clone();
            self.printed = 0;
            self.joined = false;
            self.typing = None;
            self.online = None;
        }

        if self.status.as_ref() != Some(&view.status) {
            self.status = Some(view.status.clone());
            match &view.status {
                LoadStatus::Loading => out.push("-- loading history… --".to_string()),
                LoadStatus::Failed(e) => out.push(format!("-- history unavailable: {e} --")),
                LoadStatus::NotLoaded | LoadStatus::Ready => {}
            }
        }

        if view.joined != self.joined {
            self.joined = view.joined;
            if view.joined {
                out.push("-- joined --".to_string());
            }
        }

        // A shorter log means it was rebuilt; start over.
        if view.messages.len() < self.printed {
            self.printed = 0;
        }
        for message in &view.messages[self.printed..] {
            out.push(format_message(message));
        }
        self.printed = view.messages.len();

        if view.conversation_id.is_some() && self.online != Some(view.online) {
            self.online = Some(view.online);
            out.push(if view.online { "-- online --" } else { "-- offline --" }.to_string());
        }

        let typing = view.typing_text();
        if typing != self.typing {
            if let Some(text) = &typing {
                out.push(format!("-- {text} --"));
            }
            self.typing = typing;
        }

        if view.last_error != self.last_error {
            if let Some(e) = &view.last_error {
                out.push(format!("!! {e}"));
            }
            self.last_error = view.last_error.clone();
        }

        out
    }
}
