//! Network collaborators for [`chat_sync`]: a websocket [`ws::WsChannel`]
//! with reconnection, a REST [`rest::RestHistoryClient`], and the layered
//! configuration the `chat` binary runs on.

pub mod config;
pub mod framing;
pub mod rest;
pub mod ws;

pub use config::{ClientConfig, FileConfig, TransportConfig, load_config};
pub use rest::RestHistoryClient;
pub use ws::{WsChannel, WsChannelFactory};
