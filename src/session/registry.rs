//! Session registry
//!
//! Thread-safe session table using DashMap for concurrent access. Owns the
//! two invariants reconnection depends on: a session id is owned by at most
//! one connection at any instant, and a detached session survives exactly
//! the grace window before it is force-disconnected.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::buffer::OutputBuffer;
use super::session::SessionCommand;
use super::state::{SessionState, SessionStateMachine};
use crate::protocol::{now_millis, ErrorCode, SessionDescriptor, SessionType};

/// An active session entry in the registry.
pub struct SessionEntry {
    pub id: String,
    pub session_type: SessionType,
    /// Principal that created the session; rebinds must present the same.
    pub principal_id: String,
    /// Command channel into the session task.
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    /// Output buffer shared with the owning connection's write loop.
    pub buffer: Arc<OutputBuffer>,
    /// State machine shared with the session task.
    pub state: SessionStateMachine,
    /// Connection currently owning the session, if any.
    pub owner: Option<String>,
    /// Cancel handle for the grace-window cleanup task.
    detach_cancel: Option<oneshot::Sender<()>>,
    pub rows: u16,
    pub cols: u16,
    /// Unix millis.
    pub created_at: i64,
    /// Unix millis of the last command or output.
    last_activity: Mutex<i64>,
}

impl SessionEntry {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.id.clone(),
            session_type: self.session_type,
            state: self.state.state().as_str().to_string(),
            rows: self.rows,
            cols: self.cols,
            created_at: self.created_at,
        }
    }

    pub fn last_activity(&self) -> i64 {
        *self.last_activity.lock()
    }
}

/// Registry error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("session limit reached: {current}/{max} sessions active")]
    SessionLimitReached { current: usize, max: usize },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is owned by another connection")]
    AlreadyOwned(String),

    #[error("session {0} is not owned by this connection")]
    NotOwner(String),

    #[error("session {0} is in a terminal state")]
    InvalidState(String),
}

impl RegistryError {
    /// Map onto the wire taxonomy. Ownership by another connection reports
    /// as `session_not_found` so session existence does not leak.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RegistryError::SessionLimitReached { .. } => ErrorCode::PermissionDenied,
            RegistryError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RegistryError::AlreadyOwned(_) => ErrorCode::SessionNotFound,
            RegistryError::NotOwner(_) => ErrorCode::PermissionDenied,
            RegistryError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }
}

/// Session counts by state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub connecting: usize,
    pub errored: usize,
    pub max_sessions: usize,
}

/// Registry owned by the gateway; created at startup, torn down with the
/// process.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    max_sessions: usize,
    grace_window: Duration,
    /// Serializes the limit check against inserts.
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, grace_window: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            grace_window,
            create_lock: Mutex::new(()),
        }
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Insert a new session bound to its creating connection. Fails when
    /// the session limit is reached.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        session_type: SessionType,
        principal_id: String,
        owner_connection: String,
        cmd_tx: mpsc::Sender<SessionCommand>,
        buffer: Arc<OutputBuffer>,
        state: SessionStateMachine,
        rows: u16,
        cols: u16,
    ) -> Result<String, RegistryError> {
        // Hold the lock so the count check is atomic with the insert.
        let _guard = self.create_lock.lock();

        let current = self.sessions.len();
        if current >= self.max_sessions {
            return Err(RegistryError::SessionLimitReached {
                current,
                max: self.max_sessions,
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating {} session {} for principal {} (connection {})",
            session_type.as_str(),
            session_id,
            principal_id,
            owner_connection
        );

        let entry = SessionEntry {
            id: session_id.clone(),
            session_type,
            principal_id,
            cmd_tx,
            buffer,
            state,
            owner: Some(owner_connection),
            detach_cancel: None,
            rows,
            cols,
            created_at: now_millis(),
            last_activity: Mutex::new(now_millis()),
        };
        self.sessions.insert(session_id.clone(), entry);

        Ok(session_id)
    }

    /// Resolve the command channel for a session owned by `connection_id`.
    pub fn route(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<mpsc::Sender<SessionCommand>, RegistryError> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;

        if entry.owner.as_deref() != Some(connection_id) {
            return Err(RegistryError::NotOwner(session_id.to_string()));
        }
        if entry.state.is_terminal() {
            return Err(RegistryError::InvalidState(session_id.to_string()));
        }

        *entry.last_activity.lock() = now_millis();
        Ok(entry.cmd_tx.clone())
    }

    /// Rebind a detached session to a new connection. Succeeds only inside
    /// the grace window, for the same principal, while no other connection
    /// owns the session.
    pub fn rebind(
        &self,
        session_id: &str,
        connection_id: &str,
        principal_id: &str,
    ) -> Result<(mpsc::Sender<SessionCommand>, Arc<OutputBuffer>), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;

        if entry.principal_id != principal_id {
            // Do not reveal sessions of other principals.
            warn!(
                "Rebind of session {} rejected: principal mismatch",
                session_id
            );
            return Err(RegistryError::SessionNotFound(session_id.to_string()));
        }
        if let Some(owner) = &entry.owner {
            debug!(
                "Rebind of session {} rejected: owned by connection {}",
                session_id, owner
            );
            return Err(RegistryError::AlreadyOwned(session_id.to_string()));
        }
        if entry.state.is_terminal() {
            return Err(RegistryError::InvalidState(session_id.to_string()));
        }

        if let Some(cancel) = entry.detach_cancel.take() {
            let _ = cancel.send(());
        }
        entry.owner = Some(connection_id.to_string());
        *entry.last_activity.lock() = now_millis();

        info!(
            "Session {} rebound to connection {}",
            session_id, connection_id
        );
        Ok((entry.cmd_tx.clone(), entry.buffer.clone()))
    }

    /// Release every session owned by a closing connection into the grace
    /// window. Each survives `grace_window`; expiry force-disconnects it
    /// with reason `owner_timeout`.
    pub fn detach_connection(self: &Arc<Self>, connection_id: &str) {
        let owned: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.owner.as_deref() == Some(connection_id))
            .map(|entry| entry.id.clone())
            .collect();

        if owned.is_empty() {
            return;
        }

        info!(
            "Connection {} dropped, {} session(s) entering grace window ({:?})",
            connection_id,
            owned.len(),
            self.grace_window
        );

        for session_id in owned {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                continue;
            };

            entry.owner = None;
            entry.buffer.set_drain_waker(None);

            if let Some(cancel) = entry.detach_cancel.take() {
                let _ = cancel.send(());
            }
            let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
            entry.detach_cancel = Some(cancel_tx);
            drop(entry);

            let registry = Arc::clone(self);
            let grace = self.grace_window;
            let sid = session_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {
                        info!("Grace window expired for session {}, disconnecting", sid);
                        if let Some(cmd_tx) = registry.command_sender(&sid) {
                            let _ = cmd_tx
                                .send(SessionCommand::Disconnect {
                                    reason: "owner_timeout".to_string(),
                                })
                                .await;
                        }
                        registry.remove(&sid);
                    }
                    _ = cancel_rx => {
                        debug!("Grace window cancelled for session {}", sid);
                    }
                }
            });
        }
    }

    fn command_sender(&self, session_id: &str) -> Option<mpsc::Sender<SessionCommand>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.cmd_tx.clone())
    }

    /// Output buffer handle for the owning connection's write loop.
    pub fn buffer(&self, session_id: &str) -> Option<Arc<OutputBuffer>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.buffer.clone())
    }

    /// Record the terminal size after a successful resize.
    pub fn update_size(&self, session_id: &str, rows: u16, cols: u16) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.rows = rows;
            entry.cols = cols;
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            *entry.last_activity.lock() = now_millis();
        }
    }

    /// Remove a session, cancelling any pending grace timer.
    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.remove(session_id).map(|(_, mut entry)| {
            if let Some(cancel) = entry.detach_cancel.take() {
                let _ = cancel.send(());
            }
            info!("Session {} removed from registry", session_id);
            entry
        })
    }

    pub fn descriptor(&self, session_id: &str) -> Option<SessionDescriptor> {
        self.sessions.get(session_id).map(|entry| entry.descriptor())
    }

    pub fn list(&self) -> Vec<SessionDescriptor> {
        self.sessions
            .iter()
            .map(|entry| entry.descriptor())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        let mut active = 0;
        let mut connecting = 0;
        let mut errored = 0;

        for entry in self.sessions.iter() {
            match entry.state.state() {
                SessionState::Active | SessionState::Paused | SessionState::Ready => active += 1,
                SessionState::Requested
                | SessionState::Connecting
                | SessionState::Authenticating => connecting += 1,
                SessionState::Errored => errored += 1,
                _ => {}
            }
        }

        SessionStats {
            total: self.sessions.len(),
            active,
            connecting,
            errored,
            max_sessions: self.max_sessions,
        }
    }

    /// Drop terminal sessions that have sat idle longer than `max_age`.
    /// Session tasks normally remove themselves; this catches leftovers.
    pub fn cleanup_stale(&self, max_age: Duration) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.state.is_terminal() && entry.state.time_in_state() > max_age
            })
            .map(|entry| entry.id.clone())
            .collect();

        if !stale.is_empty() {
            info!("Cleaning up {} stale sessions", stale.len());
        }
        for id in stale {
            self.remove(&id);
        }
    }

    /// Disconnect all sessions (process shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.id.clone()).collect();
        info!("Disconnecting {} sessions on shutdown", ids.len());

        for session_id in ids {
            if let Some(cmd_tx) = self.command_sender(&session_id) {
                let _ = cmd_tx
                    .send(SessionCommand::Disconnect {
                        reason: "server_shutdown".to_string(),
                    })
                    .await;
            }
            self.remove(&session_id);
        }
    }
}
