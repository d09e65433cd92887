//! JSON envelope carried in every websocket text frame.
//!
//! Envelope: `{ "v": 1, "seq": N, "type": "...", "data": {...} }`
//!
//! `data` holds the tagged event itself, so `type` is duplicated at the top
//! level for logging and routing without a second parse.

use anyhow::{Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Maximum frame size (8 MiB), enough for a base64-encoded 5 MiB attachment.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

pub const PROTOCOL_VERSION: u32 = 1;

/// Wire envelope wrapping every event.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u32,
    /// Per-connection sequence number, starting at 0.
    seq: u64,
    #[serde(rename = "type")]
    msg_type: String,
    data: serde_json::Value,
}

/// Serialize an event into envelope JSON.
pub fn encode<T: Serialize>(msg: &T, seq: u64) -> Result<String> {
    let data = serde_json::to_value(msg)?;
    let msg_type = data
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        seq,
        msg_type,
        data,
    };

    let text = serde_json::to_string(&envelope)?;
    if text.len() > MAX_FRAME_SIZE {
        bail!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        );
    }
    Ok(text)
}

/// Parse one frame.
///
/// Returns `Ok(None)` for frames this client does not understand (unknown
/// version or event type); those are skipped, not fatal.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<Option<T>> {
    if text.len() > MAX_FRAME_SIZE {
        bail!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        );
    }

    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.v != PROTOCOL_VERSION {
        tracing::warn!(version = envelope.v, "Unknown envelope version, skipping");
        return Ok(None);
    }

    match serde_json::from_value::<T>(envelope.data) {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => {
            tracing::warn!(
                msg_type = %envelope.msg_type,
                seq = envelope.seq,
                error = %e,
                "Unknown or malformed event type, skipping"
            );
            Ok(None)
        }
    }
}
