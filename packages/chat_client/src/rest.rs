//! REST history client.
//!
//! Successful responses are wrapped as `{ "data": ... }`; failures as
//! `{ "error": { "message", "status_code", "code" } }`.

use anyhow::{Context, bail};
use chat_sync::{
    ConversationId, ConversationSummary, FetchError, HistoryFetcher, Member, Message, Session,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use reqwest::Url;
use tokio::sync::watch;
use tracing::debug;

use crate::config::TransportConfig;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
    status_code: u16,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
struct MessagesData {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct ChatDetails {
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Deserialize)]
struct ChatDetailData {
    chat: ChatDetails,
}

#[derive(Deserialize)]
struct ChatsData {
    chats: Vec<ConversationSummary>,
}

/// [`HistoryFetcher`] over the chat server's HTTP API.
///
/// The bearer token is read from the current session on every request, so
/// one client can follow session changes.
pub struct RestHistoryClient {
    base_url: Url,
    http: reqwest::Client,
    sessions: Option<watch::Receiver<Option<Session>>>,
}

impl RestHistoryClient {
    pub fn new(config: &TransportConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("chat_client/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(&config.api_url)
            .with_context(|| format!("Invalid API url {}", config.api_url))?;
        if base_url.cannot_be_a_base() {
            bail!("API url {} cannot carry a path", config.api_url);
        }

        Ok(Self {
            base_url,
            http,
            sessions: None,
        })
    }

    /// Authenticate requests with the token of whatever session is current.
    pub fn with_sessions(mut self, sessions: watch::Receiver<Option<Session>>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    fn token(&self) -> Option<String> {
        self.sessions
            .as_ref()
            .and_then(|rx| rx.borrow().as_ref().and_then(|s| s.token.clone()))
    }

    /// `segments` are appended to the base path one by one, percent-encoded,
    /// so an id can never spill into a neighbouring segment or the query.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::Transport(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, FetchError> {
        let url = self.endpoint(segments)?;
        debug!(%url, "GET");

        let mut request = self.http.get(url);
        if let Some(token) = self.token() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        serde_json::from_slice::<Envelope<T>>(&body)
            .map(|envelope| envelope.data)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// The current user's conversations (`GET /chats`).
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, FetchError> {
        let data: ChatsData = self.get(&["chats"]).await?;
        Ok(data.chats)
    }
}

fn api_error(status: reqwest::StatusCode, body: &[u8]) -> FetchError {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => FetchError::Api {
            status: envelope.error.status_code,
            message: envelope.error.message,
            code: envelope.error.code,
        },
        Err(_) => FetchError::Api {
            status: status.as_u16(),
            message: format!(
                "An unexpected API error occurred. Status: {}",
                status.canonical_reason().unwrap_or("unknown")
            ),
            code: None,
        },
    }
}

impl HistoryFetcher for RestHistoryClient {
    async fn fetch_backlog(&self, conversation: &ConversationId) -> Result<Vec<Message>, FetchError> {
        let data: MessagesData = self
            .get(&["chats", conversation.as_str(), "messages"])
            .await?;
        Ok(data.messages)
    }

    async fn fetch_roster(&self, conversation: &ConversationId) -> Result<Vec<Member>, FetchError> {
        let data: ChatDetailData = self.get(&["chats", conversation.as_str()]).await?;
        Ok(data.chat.members)
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, FetchError> {
        self.conversations().await
    }
}
