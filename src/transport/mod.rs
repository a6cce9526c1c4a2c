//! Backend transport adapters
//!
//! A transport is the mechanism that actually runs the shell behind a
//! session: an SSH channel, a local PTY, or a container exec stream. All
//! three expose the same contract so the session layer stays
//! transport-agnostic. The variant is selected once at connect time.

pub mod docker;
pub mod known_hosts;
pub mod local;
pub mod pty;
pub mod ssh;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{ErrorCode, SignalName};

pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use ssh::{SshAuthMethod, SshProfile};

/// Initial terminal dimensions for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

/// Asynchronous events produced by a transport's output side.
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes the shell wrote to its terminal.
    Output(Vec<u8>),
    /// The shell exited, with an exit code when the transport knows one.
    Exited(Option<i32>),
}

/// Parameters resolved from a `connect` request, ready to dial.
#[derive(Debug, Clone)]
pub enum TransportParams {
    Ssh(SshProfile),
    Local(LocalParams),
    Docker(DockerParams),
}

#[derive(Debug, Clone, Default)]
pub struct LocalParams {
    /// Shell to fork; falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DockerParams {
    pub container_id: String,
    /// Shell to exec inside the container; defaults to `/bin/sh`.
    pub shell: Option<String>,
}

/// Error type shared by all transport variants.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key changed for {0}")]
    HostKeyChanged(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed")]
    Closed,

    #[error("signal delivery not supported on this platform")]
    SignalUnsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Map onto the wire taxonomy for `error` envelopes.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransportError::AuthFailed(_) => ErrorCode::SshAuthFailed,
            TransportError::HostKeyChanged(_) => ErrorCode::SshHostKeyChanged,
            _ => ErrorCode::ConnectionFailed,
        }
    }
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

/// Uniform contract over an open byte-stream to a shell.
///
/// Output does not flow through this trait; `open` hands back an mpsc
/// receiver of [`TransportEvent`] that the session's pump consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write input bytes to the shell.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Propagate a terminal resize.
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), TransportError>;

    /// Deliver an allow-listed signal to the shell process.
    async fn signal(&self, signal: SignalName) -> Result<(), TransportError>;

    /// Tear the transport down. Must unblock any in-flight operation.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Output event channel capacity. Bounded so a runaway shell backpressures
/// into the transport instead of growing the heap.
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 256;

pub(crate) type OutputReceiver = mpsc::Receiver<TransportEvent>;
