//! Envelope codec
//!
//! Pure transforms between raw bytes and validated frames. Decode failures
//! are reported per-message (`invalid_message`) and never terminate the
//! connection.

use serde::Deserialize;

use super::{
    ClientFrame, ClientPayload, ConnectRequest, Envelope, SignalName,
};

/// Largest terminal dimension the engine accepts.
const MAX_TERMINAL_DIM: i64 = 10_000;

/// Decode failure. Every variant maps to the `invalid_message` wire code.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("{0} message requires a session_id")]
    MissingSessionId(&'static str),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("unknown signal: {0}")]
    UnknownSignal(String),
}

fn payload_err(kind: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidPayload {
        kind,
        reason: reason.into(),
    }
}

/// Decode and validate one inbound message.
pub fn decode(raw: &[u8]) -> Result<ClientFrame, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;

    let payload = match envelope.kind.as_str() {
        "connect" => {
            let request: ConnectRequest = serde_json::from_value(envelope.data.clone())
                .map_err(|e| payload_err("connect", e.to_string()))?;
            if request.rows == 0 || request.cols == 0 {
                return Err(payload_err("connect", "rows and cols must be positive"));
            }
            ClientPayload::Connect(request)
        }
        "input" => {
            #[derive(Deserialize)]
            struct InputData {
                data: String,
            }
            let input: InputData = serde_json::from_value(envelope.data.clone())
                .map_err(|e| payload_err("input", e.to_string()))?;
            ClientPayload::Input { data: input.data }
        }
        "resize" => {
            #[derive(Deserialize)]
            struct ResizeData {
                rows: i64,
                cols: i64,
            }
            let resize: ResizeData = serde_json::from_value(envelope.data.clone())
                .map_err(|e| payload_err("resize", e.to_string()))?;
            if resize.rows < 1 || resize.cols < 1 {
                return Err(payload_err("resize", "rows and cols must be positive"));
            }
            if resize.rows > MAX_TERMINAL_DIM || resize.cols > MAX_TERMINAL_DIM {
                return Err(payload_err("resize", "rows and cols out of range"));
            }
            ClientPayload::Resize {
                rows: resize.rows as u16,
                cols: resize.cols as u16,
            }
        }
        "signal" => {
            #[derive(Deserialize)]
            struct SignalData {
                signal: String,
            }
            let signal: SignalData = serde_json::from_value(envelope.data.clone())
                .map_err(|e| payload_err("signal", e.to_string()))?;
            let name = SignalName::parse(&signal.signal)
                .ok_or(DecodeError::UnknownSignal(signal.signal))?;
            ClientPayload::Signal(name)
        }
        "disconnect" => {
            #[derive(Deserialize, Default)]
            struct DisconnectData {
                #[serde(default)]
                reason: Option<String>,
            }
            let disconnect: DisconnectData = if envelope.data.is_null() {
                DisconnectData::default()
            } else {
                serde_json::from_value(envelope.data.clone())
                    .map_err(|e| payload_err("disconnect", e.to_string()))?
            };
            ClientPayload::Disconnect {
                reason: disconnect.reason,
            }
        }
        "ping" => ClientPayload::Ping,
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };

    // Session-scoped types must carry a session_id. `connect` without one
    // allocates a new session; with one it is a rebind attempt.
    let requires_session = match payload {
        ClientPayload::Input { .. } => Some("input"),
        ClientPayload::Resize { .. } => Some("resize"),
        ClientPayload::Signal(_) => Some("signal"),
        ClientPayload::Disconnect { .. } => Some("disconnect"),
        _ => None,
    };
    if let Some(kind) = requires_session {
        if envelope.session_id.is_none() {
            return Err(DecodeError::MissingSessionId(kind));
        }
    }

    Ok(ClientFrame {
        session_id: envelope.session_id,
        timestamp: envelope.timestamp,
        payload,
    })
}

/// Encode an outbound envelope, stamping the timestamp if absent.
pub fn encode(mut envelope: Envelope) -> Vec<u8> {
    if envelope.timestamp.is_none() {
        envelope.timestamp = Some(super::now_millis());
    }
    // Envelope is plain data; serialization cannot fail.
    serde_json::to_vec(&envelope).unwrap_or_default()
}

/// Find a safe UTF-8 boundary in a byte slice: the index up to which the
/// bytes form complete UTF-8 characters. Trailing incomplete multi-byte
/// sequences are excluded so `output` messages never split a character.
pub fn find_utf8_safe_boundary(buf: &[u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }

    let mut i = buf.len();

    // Max UTF-8 char is 4 bytes; only the tail needs inspection.
    while i > 0 && i > buf.len().saturating_sub(4) {
        let byte = buf[i - 1];

        // ASCII byte - always a complete character.
        if byte & 0x80 == 0 {
            return i;
        }

        // Continuation byte - part of a multi-byte sequence, keep going back.
        if byte & 0xC0 == 0x80 {
            i -= 1;
            continue;
        }

        // Start of a multi-byte sequence; check whether it is complete.
        let char_len = if byte & 0xF8 == 0xF0 {
            4
        } else if byte & 0xF0 == 0xE0 {
            3
        } else if byte & 0xE0 == 0xC0 {
            2
        } else {
            // Invalid start byte, treat as boundary.
            return i;
        };

        let start_pos = i - 1;
        let available = buf.len() - start_pos;

        return if available >= char_len {
            start_pos + char_len
        } else {
            start_pos
        };
    }

    buf.len()
}
