//! Session lifecycle state machine
//!
//! REQUESTED -> CONNECTING -> (AUTHENTICATING) -> READY -> ACTIVE <-> PAUSED
//! -> DISCONNECTING -> CLOSED, with terminal ERRORED reachable from any
//! non-CLOSED state. Shared between the session task and the registry, so
//! transitions go through interior mutability.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Connecting,
    Authenticating,
    Ready,
    Active,
    Paused,
    Disconnecting,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }

    /// Terminal states release all session resources.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

/// Rejected transition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid transition from {from:?} to {to:?}")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
}

struct Inner {
    state: SessionState,
    error: Option<(ErrorCode, String)>,
    entered_at: Instant,
}

/// Thread-safe state machine handle. Clones share the same state.
#[derive(Clone)]
pub struct SessionStateMachine {
    inner: Arc<RwLock<Inner>>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: SessionState::Requested,
                error: None,
                entered_at: Instant::now(),
            })),
        }
    }

    fn transition(&self, allowed: &[SessionState], to: SessionState) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        if !allowed.contains(&inner.state) {
            return Err(StateError {
                from: inner.state,
                to,
            });
        }
        inner.state = to;
        inner.entered_at = Instant::now();
        Ok(())
    }

    pub fn start_connecting(&self) -> Result<(), StateError> {
        self.transition(&[SessionState::Requested], SessionState::Connecting)
    }

    /// SSH only: the dial succeeded and credentials are being checked.
    pub fn start_authenticating(&self) -> Result<(), StateError> {
        self.transition(&[SessionState::Connecting], SessionState::Authenticating)
    }

    pub fn mark_ready(&self) -> Result<(), StateError> {
        self.transition(
            &[SessionState::Connecting, SessionState::Authenticating],
            SessionState::Ready,
        )
    }

    pub fn activate(&self) -> Result<(), StateError> {
        self.transition(&[SessionState::Ready], SessionState::Active)
    }

    /// Output buffer crossed its high watermark.
    pub fn pause(&self) -> Result<(), StateError> {
        self.transition(&[SessionState::Active], SessionState::Paused)
    }

    /// Output buffer drained below its low watermark.
    pub fn resume(&self) -> Result<(), StateError> {
        self.transition(&[SessionState::Paused], SessionState::Active)
    }

    pub fn start_disconnecting(&self) -> Result<(), StateError> {
        self.transition(
            &[
                SessionState::Requested,
                SessionState::Connecting,
                SessionState::Authenticating,
                SessionState::Ready,
                SessionState::Active,
                SessionState::Paused,
            ],
            SessionState::Disconnecting,
        )
    }

    pub fn mark_closed(&self) -> Result<(), StateError> {
        self.transition(&[SessionState::Disconnecting], SessionState::Closed)
    }

    /// Move to ERRORED, recording the taxonomy code. Legal from any
    /// non-CLOSED state; idempotent once errored.
    pub fn fail(&self, code: ErrorCode, message: impl Into<String>) -> Result<(), StateError> {
        let mut inner = self.inner.write();
        if inner.state == SessionState::Closed {
            return Err(StateError {
                from: inner.state,
                to: SessionState::Errored,
            });
        }
        if inner.state != SessionState::Errored {
            inner.state = SessionState::Errored;
            inner.entered_at = Instant::now();
            inner.error = Some((code, message.into()));
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    pub fn error(&self) -> Option<(ErrorCode, String)> {
        self.inner.read().error.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// A session takes input while its transport is up, including while
    /// output flow is paused (the remote process is never starved).
    pub fn accepts_input(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Ready | SessionState::Active | SessionState::Paused
        )
    }

    pub fn time_in_state(&self) -> Duration {
        self.inner.read().entered_at.elapsed()
    }
}
