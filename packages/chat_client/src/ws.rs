//! Websocket implementation of the duplex event channel.
//!
//! One [`WsChannel`] per session. `connect` spawns a supervisor task that
//! dials the server, pumps frames both ways, and redials with exponential
//! backoff until `disconnect` cancels it. Inbound traffic and the
//! connected/disconnected signals fan out through an [`EventHub`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chat_sync::{
    ChannelError, ChannelFactory, ClientEvent, EventChannel, EventHub, EventKind, Inbound,
    ServerEvent, Session, Subscription,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::framing;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens a [`WsChannel`] for each session.
#[derive(Clone, Debug)]
pub struct WsChannelFactory {
    config: TransportConfig,
}

impl WsChannelFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for WsChannelFactory {
    fn open(&self, session: &Session) -> Arc<dyn EventChannel> {
        Arc::new(WsChannel::new(self.config.clone(), session.clone()))
    }
}

/// Writer side of the live socket. Encoding happens under the slot lock so
/// sequence numbers follow queue order.
struct Outbound {
    tx: mpsc::Sender<String>,
    seq: u64,
}

struct Shared {
    config: TransportConfig,
    session: Session,
    hub: EventHub,
    outbound: Mutex<Option<Outbound>>,
}

impl Shared {
    fn set_outbound(&self, outbound: Option<Outbound>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = outbound;
    }
}

pub struct WsChannel {
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl WsChannel {
    pub fn new(config: TransportConfig, session: Session) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                session,
                hub: EventHub::new(),
                outbound: Mutex::new(None),
            }),
            cancel: Mutex::new(None),
        }
    }

    /// Whether a socket is currently open.
    pub fn is_open(&self) -> bool {
        self.shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl EventChannel for WsChannel {
    fn connect(&self) {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.as_ref().is_some_and(|c| !c.is_cancelled()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, websocket channel cannot connect");
            self.shared.hub.dispatch(Inbound::Disconnected {
                reason: "no async runtime".to_string(),
            });
            return;
        };

        let token = CancellationToken::new();
        *cancel = Some(token.clone());
        runtime.spawn(supervise(self.shared.clone(), token));
    }

    fn disconnect(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        self.shared.set_outbound(None);
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ChannelError> {
        let mut slot = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outbound = slot.as_mut().ok_or(ChannelError::NotConnected)?;

        let text = framing::encode(&event, outbound.seq)
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        match outbound.tx.try_send(text) {
            Ok(()) => {
                outbound.seq += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ChannelError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.shared.hub.subscribe(kinds)
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Exponential reconnect delay: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Dial, serve, redial until cancelled.
async fn supervise(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(
        shared.config.reconnect_initial,
        shared.config.reconnect_max,
    );
    // Only the first failure after being up (or after `connect`) is reported.
    let mut reported_down = false;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            result = dial(&shared.config.ws_url, &shared.session) => result,
        };

        match dialed {
            Ok(stream) => {
                info!(user = %shared.session.user_id, attempt, "Websocket connected");
                backoff.reset();
                attempt = 0;
                let reason = serve(&shared, stream, &cancel).await;
                shared.set_outbound(None);
                if cancel.is_cancelled() {
                    break;
                }
                info!(user = %shared.session.user_id, %reason, "Websocket disconnected");
                shared.hub.dispatch(Inbound::Disconnected { reason });
                reported_down = true;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Websocket connect failed");
                if !reported_down {
                    shared.hub.dispatch(Inbound::Disconnected {
                        reason: format!("{e:#}"),
                    });
                    reported_down = true;
                }
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(user = %shared.session.user_id, "Websocket supervisor stopped");
}

async fn dial(url: &str, session: &Session) -> Result<WsStream> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("Invalid websocket url: {url}"))?;
    if let Some(token) = &session.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("Session token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("Websocket handshake failed")?;
    Ok(stream)
}

/// Pump one socket until it closes or the channel is cancelled.
/// Returns the disconnect reason.
async fn serve(shared: &Shared, stream: WsStream, cancel: &CancellationToken) -> String {
    let (mut ws_write, mut ws_read) = stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(shared.config.outbound_capacity);
    shared.set_outbound(Some(Outbound { tx, seq: 0 }));
    shared.hub.dispatch(Inbound::Connected);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                return "disconnected by client".to_string();
            }

            Some(text) = rx.recv() => {
                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                    return format!("write failed: {e}");
                }
            }

            frame = ws_read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match framing::decode::<ServerEvent>(text.as_str()) {
                        Ok(Some(event)) => {
                            shared.hub.dispatch(Inbound::Event(event));
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Dropping malformed frame"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    return close_reason(frame);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("read failed: {e}"),
                None => return "connection closed".to_string(),
            },
        }
    }
}

fn close_reason(frame: Option<CloseFrame>) -> String {
    frame
        .map(|f| f.reason.to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| "closed by server".to_string())
}
