//! WebSocket gateway server
//!
//! Accept loop over a TcpListener; every accepted socket becomes one
//! connection manager. The gateway owns the session registry and the
//! known-hosts store, both created at startup and torn down with the
//! process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use super::connection::handle_connection;
use crate::config::{ConfigError, EngineConfig};
use crate::services::{AuthService, CommandHistorySink, ProfileStore, RateLimiter};
use crate::session::SessionRegistry;
use crate::transport::KnownHostsStore;

/// Boundary collaborators, injected at startup.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthService>,
    pub profiles: Arc<dyn ProfileStore>,
    pub history: Arc<dyn CommandHistorySink>,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

/// State shared by every connection of one gateway.
pub(crate) struct GatewayShared {
    pub config: EngineConfig,
    pub registry: Arc<SessionRegistry>,
    pub services: Services,
    pub known_hosts: Arc<KnownHostsStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The gateway: listener plus shared engine state.
pub struct Gateway {
    listener: TcpListener,
    shared: Arc<GatewayShared>,
}

impl Gateway {
    /// Validate the config and bind the listener.
    pub async fn bind(config: EngineConfig, services: Services) -> Result<Self, GatewayError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.bind_addr).await?;
        let registry = Arc::new(SessionRegistry::new(
            config.max_sessions,
            config.grace_window(),
        ));

        info!(
            "Gateway listening on {} (keepalive {:?}, grace {:?})",
            listener.local_addr()?,
            config.keepalive_interval,
            config.grace_window()
        );

        Ok(Self {
            listener,
            shared: Arc::new(GatewayShared {
                config,
                registry,
                services,
                known_hosts: Arc::new(KnownHostsStore::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the session registry (shutdown, stats).
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.shared.registry.clone()
    }

    /// Run the accept loop until the listener fails.
    pub async fn run(self) -> Result<(), GatewayError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!("Accepted connection from {}", peer);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                handle_connection(stream, shared).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        InMemoryProfileStore, StaticTokenAuth, TracingHistorySink, WindowRateLimiter,
    };
    use crate::session::FlowControlConfig;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const TEST_TOKEN: &str = "integration-test-token";

    fn test_services(rate_limit: u32) -> Services {
        Services {
            auth: Arc::new(StaticTokenAuth::new(TEST_TOKEN)),
            profiles: Arc::new(InMemoryProfileStore::new()),
            history: Arc::new(TracingHistorySink),
            rate_limiter: Arc::new(WindowRateLimiter::new(rate_limit)),
        }
    }

    async fn start_gateway(config: EngineConfig, services: Services) -> (SocketAddr, Arc<SessionRegistry>) {
        let gateway = Gateway::bind(config, services).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        let registry = gateway.registry();
        tokio::spawn(async move {
            let _ = gateway.run().await;
        });
        (addr, registry)
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            keepalive_interval: Duration::from_secs(30),
            grace_window: Some(Duration::from_secs(2)),
            connect_timeout: Duration::from_secs(10),
            flow_control: FlowControlConfig::default(),
            max_sessions: 8,
            messages_per_minute: 1000,
            rate_limit_strikes: 3,
        }
    }

    async fn connect_client(addr: SocketAddr) -> ClientWs {
        let url = format!("ws://{}/?token={}&device_id=test-device", addr, TEST_TOKEN);
        let (ws, _response) = connect_async(url).await.unwrap();
        ws
    }

    async fn send_json(ws: &mut ClientWs, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Next JSON frame, skipping WebSocket control frames.
    async fn recv_json(ws: &mut ClientWs) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Binary(data) => return serde_json::from_slice(&data).unwrap(),
                _ => continue,
            }
        }
    }

    /// Read frames until one matches; panics on timeout.
    async fn recv_until<F: Fn(&Value) -> bool>(ws: &mut ClientWs, accept: F) -> Value {
        for _ in 0..200 {
            let frame = recv_json(ws).await;
            if accept(&frame) {
                return frame;
            }
        }
        panic!("expected frame never arrived");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _registry) = start_gateway(test_config(), test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(&mut ws, json!({"type": "ping"})).await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "pong");
        assert!(frame["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_invalid_message_does_not_kill_connection() {
        let (addr, _registry) = start_gateway(test_config(), test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        ws.send(Message::Text("{not valid json".to_string()))
            .await
            .unwrap();
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "invalid_message");

        // Unknown type and missing session_id behave the same.
        send_json(&mut ws, json!({"type": "reboot"})).await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["data"]["code"], "invalid_message");

        // The connection is still alive.
        send_json(&mut ws, json!({"type": "ping"})).await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "pong");
    }

    #[tokio::test]
    async fn test_bad_token_rejected() {
        let (addr, _registry) = start_gateway(test_config(), test_services(1000)).await;

        let url = format!("ws://{}/?token=wrong-token-here!!!!", addr);
        let (mut ws, _response) = connect_async(url).await.unwrap();

        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "authentication_failed");

        // Server closes the socket after the error.
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        assert!(matches!(next, None | Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn test_command_for_unknown_session() {
        let (addr, _registry) = start_gateway(test_config(), test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(
            &mut ws,
            json!({"type": "input", "session_id": "missing", "data": {"data": "ls\n"}}),
        )
        .await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "session_not_found");
        assert_eq!(frame["data"]["retryable"], false);
        assert_eq!(frame["session_id"], "missing");
    }

    #[tokio::test]
    async fn test_ssh_connect_requires_known_profile() {
        let (addr, _registry) = start_gateway(test_config(), test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(
            &mut ws,
            json!({"type": "connect", "data": {"session_type": "ssh"}}),
        )
        .await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["data"]["code"], "invalid_message");

        send_json(
            &mut ws,
            json!({"type": "connect", "data": {"session_type": "ssh", "profile_id": "nope"}}),
        )
        .await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["data"]["code"], "connection_failed");
        assert_eq!(frame["data"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_local_session_lifecycle() {
        let (addr, registry) = start_gateway(test_config(), test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(
            &mut ws,
            json!({
                "type": "connect",
                "data": {"session_type": "local", "shell": "/bin/sh", "rows": 24, "cols": 80}
            }),
        )
        .await;

        // Lifecycle: status connecting, then ready, with a session_id.
        let connecting = recv_until(&mut ws, |f| {
            f["type"] == "status" && f["data"]["status"] == "connecting"
        })
        .await;
        let session_id = connecting["session_id"].as_str().unwrap().to_string();

        recv_until(&mut ws, |f| {
            f["type"] == "status" && f["data"]["status"] == "ready"
        })
        .await;
        let info = recv_until(&mut ws, |f| f["type"] == "session_info").await;
        assert_eq!(info["data"]["session_type"], "local");
        assert_eq!(registry.count(), 1);

        // Input produces output.
        send_json(
            &mut ws,
            json!({
                "type": "input",
                "session_id": session_id,
                "data": {"data": "echo gateway_roundtrip_ok\n"}
            }),
        )
        .await;
        recv_until(&mut ws, |f| {
            f["type"] == "output"
                && f["data"]["data"]
                    .as_str()
                    .is_some_and(|s| s.contains("gateway_roundtrip_ok"))
        })
        .await;

        // Resize is accepted silently.
        send_json(
            &mut ws,
            json!({
                "type": "resize",
                "session_id": session_id,
                "data": {"rows": 50, "cols": 132}
            }),
        )
        .await;

        // Graceful disconnect.
        send_json(
            &mut ws,
            json!({"type": "disconnect", "session_id": session_id, "data": {"reason": "done"}}),
        )
        .await;
        let frame = recv_until(&mut ws, |f| {
            f["type"] == "status" && f["data"]["status"] == "disconnected"
        })
        .await;
        assert_eq!(frame["data"]["detail"], "done");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_window_delivers_buffered_output() {
        let (addr, registry) = start_gateway(test_config(), test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(
            &mut ws,
            json!({"type": "connect", "data": {"session_type": "local", "shell": "/bin/sh"}}),
        )
        .await;
        let info = recv_until(&mut ws, |f| f["type"] == "session_info").await;
        let session_id = info["session_id"].as_str().unwrap().to_string();

        // Schedule output that lands while no connection is attached.
        send_json(
            &mut ws,
            json!({
                "type": "input",
                "session_id": session_id,
                "data": {"data": "(sleep 0.4; echo delayed_after_drop) &\n"}
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Drop the socket; the session enters the grace window.
        drop(ws);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.count(), 1, "session must survive the disconnect");

        // Reconnect and rebind with the same session_id.
        let mut ws = connect_client(addr).await;
        send_json(
            &mut ws,
            json!({
                "type": "connect",
                "session_id": session_id,
                "data": {"session_type": "local"}
            }),
        )
        .await;
        recv_until(&mut ws, |f| f["type"] == "session_info").await;

        // Output buffered during the detach arrives after rebind.
        recv_until(&mut ws, |f| {
            f["type"] == "output"
                && f["data"]["data"]
                    .as_str()
                    .is_some_and(|s| s.contains("delayed_after_drop"))
        })
        .await;

        // The session still works.
        send_json(
            &mut ws,
            json!({
                "type": "input",
                "session_id": session_id,
                "data": {"data": "echo alive_after_rebind\n"}
            }),
        )
        .await;
        recv_until(&mut ws, |f| {
            f["type"] == "output"
                && f["data"]["data"]
                    .as_str()
                    .is_some_and(|s| s.contains("alive_after_rebind"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_reconnect_after_grace_window_fails() {
        let mut config = test_config();
        config.grace_window = Some(Duration::from_millis(200));
        let (addr, registry) = start_gateway(config, test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(
            &mut ws,
            json!({"type": "connect", "data": {"session_type": "local", "shell": "/bin/sh"}}),
        )
        .await;
        let info = recv_until(&mut ws, |f| f["type"] == "session_info").await;
        let session_id = info["session_id"].as_str().unwrap().to_string();

        drop(ws);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.count(), 0, "grace expiry must tear the session down");

        let mut ws = connect_client(addr).await;
        send_json(
            &mut ws,
            json!({
                "type": "connect",
                "session_id": session_id,
                "data": {"session_type": "local"}
            }),
        )
        .await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "session_not_found");
    }

    #[tokio::test]
    async fn test_rate_limit_strikes_close_connection() {
        // Budget of 2 messages/minute, 3 strikes allowed.
        let (addr, _registry) = start_gateway(test_config(), test_services(2)).await;
        let mut ws = connect_client(addr).await;

        for _ in 0..6 {
            send_json(&mut ws, json!({"type": "ping"})).await;
        }

        let mut pongs = 0;
        let mut rate_errors = 0;
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for rate limit close");
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    match frame["type"].as_str() {
                        Some("pong") => pongs += 1,
                        Some("error") => {
                            assert_eq!(frame["data"]["code"], "rate_limited");
                            assert_eq!(frame["data"]["retryable"], true);
                            rate_errors += 1;
                        }
                        other => panic!("unexpected frame type {:?}", other),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }

        assert_eq!(pongs, 2);
        assert_eq!(rate_errors, 3);
    }

    #[tokio::test]
    async fn test_missed_keepalives_close_connection_but_not_sessions() {
        let mut config = test_config();
        config.keepalive_interval = Duration::from_millis(150);
        config.grace_window = Some(Duration::from_secs(5));
        let (addr, registry) = start_gateway(config, test_services(1000)).await;
        let mut ws = connect_client(addr).await;

        send_json(
            &mut ws,
            json!({"type": "connect", "data": {"session_type": "local", "shell": "/bin/sh"}}),
        )
        .await;
        recv_until(&mut ws, |f| f["type"] == "session_info").await;

        // Stop pinging; the server must drop the connection after two
        // missed intervals.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, ws.next()).await {
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("server never closed the silent connection"),
            }
        }

        // The session survived into the grace window.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.count(), 1);
    }
}
