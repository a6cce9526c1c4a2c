//! Boundary collaborators
//!
//! The engine treats authentication, profile storage, command history, and
//! rate limiting as external services and only specifies their interfaces.
//! The default implementations here are enough for single-process
//! deployments and tests; real deployments swap in their own.

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::transport::SshProfile;

/// Identity attached to a connection after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub device_id: String,
}

/// Handshake rejection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Validates a bearer token passed as a connection query parameter and
/// resolves it to a principal. Token issuance lives elsewhere.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authenticate(&self, token: &str, device_id: Option<&str>)
        -> Result<Principal, AuthError>;
}

/// Resolves an `ssh_profile_id` to connection parameters. The engine never
/// persists credentials itself.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn lookup(&self, profile_id: &str) -> Option<SshProfile>;
}

/// A command line extracted from session input.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub session_id: String,
    pub command: String,
    /// Unix millis.
    pub at: i64,
}

/// Fire-and-forget sink for "command executed" events. The engine never
/// reads this store back.
pub trait CommandHistorySink: Send + Sync {
    fn record(&self, event: CommandEvent);
}

/// Consulted before each inbound message is processed.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, connection_id: &str) -> bool;

    /// Drop per-connection state after teardown.
    fn forget(&self, _connection_id: &str) {}
}

// ---------------------------------------------------------------------------
// Default implementations
// ---------------------------------------------------------------------------

/// Single shared-token authenticator with constant-time comparison.
pub struct StaticTokenAuth {
    token: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthService for StaticTokenAuth {
    async fn authenticate(
        &self,
        token: &str,
        device_id: Option<&str>,
    ) -> Result<Principal, AuthError> {
        let received = token.trim().as_bytes();
        let expected = self.token.as_bytes();

        // Length check first; it does not leak token content.
        if received.len() != expected.len() {
            warn!("Token validation failed: wrong length");
            return Err(AuthError::InvalidToken);
        }

        if !bool::from(received.ct_eq(expected)) {
            warn!("Token validation failed: mismatch");
            return Err(AuthError::InvalidToken);
        }

        Ok(Principal {
            principal_id: "local".to_string(),
            device_id: device_id.unwrap_or("unknown").to_string(),
        })
    }
}

/// In-memory profile store.
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<String, SshProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile_id: impl Into<String>, profile: SshProfile) {
        self.profiles.insert(profile_id.into(), profile);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn lookup(&self, profile_id: &str) -> Option<SshProfile> {
        self.profiles.get(profile_id).map(|p| p.value().clone())
    }
}

/// History sink that logs instead of persisting.
#[derive(Default)]
pub struct TracingHistorySink;

impl CommandHistorySink for TracingHistorySink {
    fn record(&self, event: CommandEvent) {
        debug!(
            "Command executed in session {}: {}",
            event.session_id, event.command
        );
    }
}

/// Sliding-window rate limiter, counting message timestamps per connection.
pub struct WindowRateLimiter {
    max_per_minute: u32,
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl WindowRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            windows: DashMap::new(),
        }
    }

}

impl RateLimiter for WindowRateLimiter {
    fn allow(&self, connection_id: &str) -> bool {
        let now = Instant::now();
        let window = self
            .windows
            .entry(connection_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));

        let mut timestamps = window.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front).as_secs() >= 60 {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_per_minute as usize {
            return false;
        }

        timestamps.push_back(now);
        true
    }

    fn forget(&self, connection_id: &str) {
        self.windows.remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SshAuthMethod;

    #[tokio::test]
    async fn test_static_token_accepts_match() {
        let auth = StaticTokenAuth::new("sekrit-token");
        let principal = auth.authenticate("sekrit-token", Some("dev-1")).await.unwrap();
        assert_eq!(principal.device_id, "dev-1");
    }

    #[tokio::test]
    async fn test_static_token_rejects_mismatch() {
        let auth = StaticTokenAuth::new("sekrit-token");
        assert!(auth.authenticate("wrong-token!", None).await.is_err());
        assert!(auth.authenticate("short", None).await.is_err());
    }

    #[tokio::test]
    async fn test_profile_store_lookup() {
        let store = InMemoryProfileStore::new();
        store.insert(
            "p1",
            SshProfile {
                host: "example.com".to_string(),
                port: 22,
                username: "deploy".to_string(),
                auth: SshAuthMethod::Password {
                    password: "pw".to_string(),
                },
                strict_host_key_checking: false,
            },
        );

        assert!(store.lookup("p1").await.is_some());
        assert!(store.lookup("p2").await.is_none());
    }

    #[test]
    fn test_rate_limiter_budget() {
        let limiter = WindowRateLimiter::new(3);
        assert!(limiter.allow("c1"));
        assert!(limiter.allow("c1"));
        assert!(limiter.allow("c1"));
        assert!(!limiter.allow("c1"));

        // Other connections have their own budget.
        assert!(limiter.allow("c2"));

        limiter.forget("c1");
        assert!(limiter.allow("c1"));
    }
}
