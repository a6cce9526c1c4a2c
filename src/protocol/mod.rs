//! Wire protocol types
//!
//! JSON envelope shared by both directions: `{type, session_id?, data, timestamp?}`.
//! Client -> server: connect, input, resize, signal, disconnect, ping.
//! Server -> client: output, status, error, session_info, pong, flow_control.

mod codec;

pub use codec::{decode, encode, find_utf8_safe_boundary, DecodeError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire envelope. `data` is a type-specific object; the codec validates
/// its shape before anything downstream sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    pub fn new(kind: &str, session_id: Option<String>, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            session_id,
            data,
            timestamp: None,
        }
    }
}

/// Kind of shell a session is attached to. Selected once at connect time;
/// never re-dispatched per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Ssh,
    Local,
    Docker,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Ssh => "ssh",
            SessionType::Local => "local",
            SessionType::Docker => "docker",
        }
    }
}

/// Signals a client may deliver to a session. Fixed allow-list; anything
/// else is rejected at decode time with `invalid_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalName {
    Sigint,
    Sigtstp,
    Sigterm,
    Sigkill,
    Sigquit,
}

impl SignalName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalName::Sigint => "SIGINT",
            SignalName::Sigtstp => "SIGTSTP",
            SignalName::Sigterm => "SIGTERM",
            SignalName::Sigkill => "SIGKILL",
            SignalName::Sigquit => "SIGQUIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SIGINT" => Some(SignalName::Sigint),
            "SIGTSTP" => Some(SignalName::Sigtstp),
            "SIGTERM" => Some(SignalName::Sigterm),
            "SIGKILL" => Some(SignalName::Sigkill),
            "SIGQUIT" => Some(SignalName::Sigquit),
            _ => None,
        }
    }
}

/// Stable error taxonomy carried in every `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConnectionFailed,
    SshAuthFailed,
    SshHostKeyChanged,
    SessionNotFound,
    SessionTimeout,
    PermissionDenied,
    InvalidMessage,
    InvalidState,
    RateLimited,
    AuthenticationFailed,
    OwnerTimeout,
}

impl ErrorCode {
    /// Hint for clients deciding whether an automatic retry makes sense.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed | ErrorCode::SessionTimeout | ErrorCode::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "connection_failed",
            ErrorCode::SshAuthFailed => "ssh_auth_failed",
            ErrorCode::SshHostKeyChanged => "ssh_host_key_changed",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionTimeout => "session_timeout",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::AuthenticationFailed => "authentication_failed",
            ErrorCode::OwnerTimeout => "owner_timeout",
        }
    }
}

/// Lifecycle announcements in `status` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Authenticating,
    Ready,
    Disconnected,
}

/// Direction of a `flow_control` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlAction {
    Pause,
    Resume,
}

/// Payload of a `connect` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub session_type: SessionType,
    /// SSH profile reference, resolved through the profile store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    /// Container id or name, required for docker sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Optional shell path for local and docker sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// A fully validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub session_id: Option<String>,
    pub timestamp: Option<i64>,
    pub payload: ClientPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientPayload {
    Connect(ConnectRequest),
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Signal(SignalName),
    Disconnect { reason: Option<String> },
    Ping,
}

/// Session metadata reported in `session_info` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub session_type: SessionType,
    pub state: String,
    pub rows: u16,
    pub cols: u16,
    /// Unix millis.
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Server frame constructors
// ---------------------------------------------------------------------------

pub fn output_frame(session_id: &str, text: String) -> Envelope {
    Envelope::new(
        "output",
        Some(session_id.to_string()),
        serde_json::json!({ "data": text }),
    )
}

pub fn status_frame(session_id: &str, status: SessionStatus, detail: Option<&str>) -> Envelope {
    let data = match detail {
        Some(d) => serde_json::json!({ "status": status, "detail": d }),
        None => serde_json::json!({ "status": status }),
    };
    Envelope::new("status", Some(session_id.to_string()), data)
}

pub fn error_frame(session_id: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Envelope {
    Envelope::new(
        "error",
        session_id.map(String::from),
        serde_json::json!({
            "code": code,
            "message": message.into(),
            "retryable": code.retryable(),
        }),
    )
}

pub fn session_info_frame(descriptor: &SessionDescriptor) -> Envelope {
    Envelope::new(
        "session_info",
        Some(descriptor.session_id.clone()),
        serde_json::to_value(descriptor).unwrap_or(Value::Null),
    )
}

pub fn pong_frame() -> Envelope {
    Envelope::new("pong", None, Value::Null)
}

pub fn flow_control_frame(session_id: &str, action: FlowControlAction) -> Envelope {
    Envelope::new(
        "flow_control",
        Some(session_id.to_string()),
        serde_json::json!({ "action": action }),
    )
}

/// Current unix timestamp in milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
