//! Per-connection manager
//!
//! One read loop and one write loop per WebSocket, communicating over
//! bounded channels. The read loop rate-limits, decodes, and dispatches to
//! session command queues; the write loop forwards control frames and
//! drains the output buffers of every owned session. A keepalive supervisor
//! closes the connection (not its sessions) when the client stops pinging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::server::GatewayShared;
use crate::protocol::{
    decode, encode, error_frame, pong_frame, session_info_frame, ClientPayload, ConnectRequest,
    Envelope, ErrorCode, SessionType,
};
use crate::services::Principal;
use crate::session::{
    OutputBuffer, RegistryError, SessionCommand, SessionContext, SessionParams,
};
use crate::transport::{DockerParams, LocalParams, TerminalSize, TransportParams};

/// Write-path timeout; an unresponsive client is disconnected rather than
/// allowed to stall the loop.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on bytes drained from one session per write-loop round.
const WRITE_CHUNK_BYTES: usize = 64 * 1024;

/// Control-frame channel capacity per connection.
const CTRL_CHANNEL_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type SharedBuffers = Arc<RwLock<HashMap<String, Arc<OutputBuffer>>>>;

/// Liveness state shared between the read loop and the keepalive task.
struct ConnectionState {
    /// Last inbound activity (unix millis).
    last_seen: AtomicU64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            last_seen: AtomicU64::new(crate::protocol::now_millis() as u64),
        }
    }

    fn touch(&self) {
        self.last_seen
            .store(crate::protocol::now_millis() as u64, Ordering::SeqCst);
    }

    fn last_seen_millis(&self) -> u64 {
        self.last_seen.load(Ordering::SeqCst)
    }
}

fn to_ws_message(envelope: Envelope) -> Message {
    Message::Text(String::from_utf8_lossy(&encode(envelope)).into_owned())
}

/// Accept, authenticate, and serve one WebSocket connection.
pub(crate) async fn handle_connection(stream: TcpStream, shared: Arc<GatewayShared>) {
    // Interactive terminal traffic; never batch small frames.
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    // Capture the bearer token and device id from the upgrade request's
    // query string.
    let mut token: Option<String> = None;
    let mut device_id: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        if let Some(query) = request.uri().query() {
            for pair in query.split('&') {
                let mut parts = pair.splitn(2, '=');
                match (parts.next(), parts.next()) {
                    (Some("token"), Some(value)) => token = Some(value.to_string()),
                    (Some("device_id"), Some(value)) => device_id = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        Ok(response)
    };

    let mut ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    // Delegated handshake: the auth service resolves the opaque token to a
    // principal. Rejection is connection-fatal.
    let token = token.unwrap_or_default();
    let principal = match shared
        .services
        .auth
        .authenticate(&token, device_id.as_deref())
        .await
    {
        Ok(principal) => principal,
        Err(e) => {
            warn!("Connection handshake rejected: {}", e);
            let frame = error_frame(None, ErrorCode::AuthenticationFailed, e.to_string());
            let _ = ws_stream.send(to_ws_message(frame)).await;
            let _ = ws_stream.close(None).await;
            return;
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(
        "Connection {} established for principal {} (device {})",
        connection_id, principal.principal_id, principal.device_id
    );

    let state = Arc::new(ConnectionState::new());
    let buffers: SharedBuffers = Arc::new(RwLock::new(HashMap::new()));
    let notify = Arc::new(Notify::new());
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Envelope>(CTRL_CHANNEL_CAPACITY);

    let (ws_sink, ws_source) = ws_stream.split();

    let mut write_task = tokio::spawn(write_loop(
        ws_sink,
        ctrl_rx,
        buffers.clone(),
        notify.clone(),
    ));

    let mut read_task = tokio::spawn(read_loop(
        ws_source,
        shared.clone(),
        connection_id.clone(),
        principal,
        state.clone(),
        ctrl_tx,
        buffers.clone(),
        notify.clone(),
    ));

    let keepalive = shared.config.keepalive_interval;
    let state_ka = state.clone();
    let cid_ka = connection_id.clone();
    let mut keepalive_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(keepalive);
        // First tick fires immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let now = crate::protocol::now_millis() as u64;
            let silent_for = now.saturating_sub(state_ka.last_seen_millis());
            if silent_for > 2 * keepalive.as_millis() as u64 {
                warn!(
                    "Connection {} missed two keepalive intervals ({}ms silent), closing",
                    cid_ka, silent_for
                );
                break;
            }
        }
    });

    // First task to finish tears the connection down.
    let write_done = tokio::select! {
        _ = &mut write_task => {
            debug!("Write loop finished for connection {}", connection_id);
            true
        }
        _ = &mut read_task => {
            debug!("Read loop finished for connection {}", connection_id);
            false
        }
        _ = &mut keepalive_task => {
            debug!("Keepalive expired for connection {}", connection_id);
            false
        }
    };
    read_task.abort();
    keepalive_task.abort();
    if !write_done {
        // Let the write loop flush queued control frames before it goes away.
        let _ = tokio::time::timeout(Duration::from_millis(100), &mut write_task).await;
        write_task.abort();
    }

    // Sessions survive the socket: they detach into the grace window.
    for buffer in buffers.read().values() {
        buffer.set_drain_waker(None);
    }
    shared.registry.detach_connection(&connection_id);
    shared.services.rate_limiter.forget(&connection_id);

    info!("Connection {} closed", connection_id);
}

/// Write loop: control frames from sessions and the read loop, plus
/// round-robin drains of every attached session's output buffer.
async fn write_loop(
    mut sink: WsSink,
    mut ctrl_rx: mpsc::Receiver<Envelope>,
    buffers: SharedBuffers,
    notify: Arc<Notify>,
) {
    loop {
        tokio::select! {
            frame = ctrl_rx.recv() => {
                match frame {
                    Some(envelope) => {
                        if send_frame(&mut sink, envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = notify.notified() => {
                if drain_attached(&mut sink, &buffers, &notify).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Write loop stopped");
}

async fn send_frame(sink: &mut WsSink, envelope: Envelope) -> Result<(), ()> {
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(to_ws_message(envelope))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("WebSocket send failed: {}", e);
            Err(())
        }
        Err(_) => {
            warn!("WebSocket send timeout - client unresponsive, disconnecting");
            Err(())
        }
    }
}

/// Drain each attached buffer once, bounded per round for fairness across
/// sessions; re-arm the notify when anything is left.
async fn drain_attached(
    sink: &mut WsSink,
    buffers: &SharedBuffers,
    notify: &Arc<Notify>,
) -> Result<(), ()> {
    let attached: Vec<(String, Arc<OutputBuffer>)> = buffers
        .read()
        .iter()
        .map(|(id, buffer)| (id.clone(), buffer.clone()))
        .collect();

    let mut backlog = false;
    for (session_id, buffer) in attached {
        for chunk in buffer.drain(WRITE_CHUNK_BYTES) {
            let text = String::from_utf8_lossy(&chunk).into_owned();
            send_frame(sink, crate::protocol::output_frame(&session_id, text)).await?;
        }
        if !buffer.is_empty() {
            backlog = true;
        }
    }

    if backlog {
        notify.notify_one();
    }
    Ok(())
}

/// Read loop: rate limit, decode, dispatch.
#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut source: WsSource,
    shared: Arc<GatewayShared>,
    connection_id: String,
    principal: Principal,
    state: Arc<ConnectionState>,
    ctrl_tx: mpsc::Sender<Envelope>,
    buffers: SharedBuffers,
    notify: Arc<Notify>,
) {
    let mut strikes: u32 = 0;

    while let Some(msg) = source.next().await {
        let raw = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.touch();
                continue;
            }
            Ok(Message::Close(_)) => {
                info!("Connection {} closed by client", connection_id);
                break;
            }
            Ok(Message::Frame(_)) => continue,
            Err(e) => {
                warn!("Connection {} receive error: {}", connection_id, e);
                break;
            }
        };
        state.touch();

        // Externally supplied policy; consulted before any processing.
        if !shared.services.rate_limiter.allow(&connection_id) {
            strikes += 1;
            let _ = ctrl_tx
                .send(error_frame(
                    None,
                    ErrorCode::RateLimited,
                    "message rate limit exceeded",
                ))
                .await;
            if strikes >= shared.config.rate_limit_strikes {
                warn!(
                    "Connection {} exceeded rate limit {} times, closing",
                    connection_id, strikes
                );
                break;
            }
            continue;
        }
        strikes = 0;

        let frame = match decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                // Per-message failure; the connection survives.
                debug!("Connection {} sent invalid message: {}", connection_id, e);
                let _ = ctrl_tx
                    .send(error_frame(None, ErrorCode::InvalidMessage, e.to_string()))
                    .await;
                continue;
            }
        };

        match frame.payload {
            ClientPayload::Ping => {
                let _ = ctrl_tx.send(pong_frame()).await;
            }
            ClientPayload::Connect(request) => {
                handle_connect(
                    &shared,
                    &connection_id,
                    &principal,
                    &ctrl_tx,
                    &buffers,
                    &notify,
                    frame.session_id,
                    request,
                )
                .await;
            }
            ClientPayload::Input { data } => {
                let session_id = frame.session_id.expect("validated by codec");
                route_command(
                    &shared,
                    &connection_id,
                    &ctrl_tx,
                    &session_id,
                    SessionCommand::Input(data.into_bytes()),
                )
                .await;
            }
            ClientPayload::Resize { rows, cols } => {
                let session_id = frame.session_id.expect("validated by codec");
                route_command(
                    &shared,
                    &connection_id,
                    &ctrl_tx,
                    &session_id,
                    SessionCommand::Resize { rows, cols },
                )
                .await;
            }
            ClientPayload::Signal(signal) => {
                let session_id = frame.session_id.expect("validated by codec");
                route_command(
                    &shared,
                    &connection_id,
                    &ctrl_tx,
                    &session_id,
                    SessionCommand::Signal(signal),
                )
                .await;
            }
            ClientPayload::Disconnect { reason } => {
                let session_id = frame.session_id.expect("validated by codec");
                match shared.registry.route(&session_id, &connection_id) {
                    Ok(cmd_tx) => {
                        let _ = cmd_tx
                            .send(SessionCommand::Disconnect {
                                reason: reason.unwrap_or_else(|| "client_request".to_string()),
                            })
                            .await;
                    }
                    // Disconnect is idempotent: an unknown or already
                    // closed session is a no-op.
                    Err(RegistryError::SessionNotFound(_))
                    | Err(RegistryError::InvalidState(_)) => {}
                    Err(e) => {
                        let _ = ctrl_tx
                            .send(error_frame(
                                Some(&session_id),
                                e.error_code(),
                                e.to_string(),
                            ))
                            .await;
                    }
                }
            }
        }
    }
    debug!("Read loop stopped for connection {}", connection_id);
}

/// `connect` without a session id allocates a session; with one it is a
/// rebind attempt for a session surviving in the grace window.
#[allow(clippy::too_many_arguments)]
async fn handle_connect(
    shared: &Arc<GatewayShared>,
    connection_id: &str,
    principal: &Principal,
    ctrl_tx: &mpsc::Sender<Envelope>,
    buffers: &SharedBuffers,
    notify: &Arc<Notify>,
    session_id: Option<String>,
    request: ConnectRequest,
) {
    if let Some(session_id) = session_id {
        match shared
            .registry
            .rebind(&session_id, connection_id, &principal.principal_id)
        {
            Ok((cmd_tx, buffer)) => {
                buffers
                    .write()
                    .insert(session_id.clone(), buffer.clone());
                buffer.set_drain_waker(Some(notify.clone()));
                let _ = cmd_tx
                    .send(SessionCommand::Rebind {
                        ctrl_tx: ctrl_tx.clone(),
                    })
                    .await;
                info!(
                    "Connection {} rebound session {}",
                    connection_id, session_id
                );
            }
            Err(e) => {
                let _ = ctrl_tx
                    .send(error_frame(
                        Some(&session_id),
                        e.error_code(),
                        e.to_string(),
                    ))
                    .await;
            }
        }
        return;
    }

    let transport = match resolve_transport(shared, &request).await {
        Ok(transport) => transport,
        Err((code, message)) => {
            let _ = ctrl_tx.send(error_frame(None, code, message)).await;
            return;
        }
    };

    let ctx = SessionContext {
        registry: shared.registry.clone(),
        known_hosts: shared.known_hosts.clone(),
        history: shared.services.history.clone(),
        connect_timeout: shared.config.connect_timeout,
        flow_control: shared.config.flow_control,
    };
    let params = SessionParams {
        session_type: request.session_type,
        transport,
        size: TerminalSize {
            rows: request.rows,
            cols: request.cols,
        },
        principal_id: principal.principal_id.clone(),
        connection_id: connection_id.to_string(),
    };

    match crate::session::spawn_session(ctx, params, ctrl_tx.clone()) {
        Ok(session_id) => {
            if let Some(buffer) = shared.registry.buffer(&session_id) {
                buffers
                    .write()
                    .insert(session_id.clone(), buffer.clone());
                buffer.set_drain_waker(Some(notify.clone()));
            }
            if let Some(descriptor) = shared.registry.descriptor(&session_id) {
                let _ = ctrl_tx.send(session_info_frame(&descriptor)).await;
            }
        }
        Err(e) => {
            let _ = ctrl_tx
                .send(error_frame(None, e.error_code(), e.to_string()))
                .await;
        }
    }
}

/// Resolve a connect request into dial-ready transport parameters.
async fn resolve_transport(
    shared: &Arc<GatewayShared>,
    request: &ConnectRequest,
) -> Result<TransportParams, (ErrorCode, String)> {
    match request.session_type {
        SessionType::Ssh => {
            let profile_id = request.profile_id.as_deref().ok_or((
                ErrorCode::InvalidMessage,
                "ssh connect requires profile_id".to_string(),
            ))?;
            let profile = shared.services.profiles.lookup(profile_id).await.ok_or((
                ErrorCode::ConnectionFailed,
                format!("unknown ssh profile: {}", profile_id),
            ))?;
            Ok(TransportParams::Ssh(profile))
        }
        SessionType::Local => Ok(TransportParams::Local(LocalParams {
            shell: request.shell.clone(),
        })),
        SessionType::Docker => {
            let container_id = request.container_id.as_deref().ok_or((
                ErrorCode::InvalidMessage,
                "docker connect requires container_id".to_string(),
            ))?;
            Ok(TransportParams::Docker(DockerParams {
                container_id: container_id.to_string(),
                shell: request.shell.clone(),
            }))
        }
    }
}

/// Forward a command to a session owned by this connection, mapping
/// registry refusals onto error envelopes.
async fn route_command(
    shared: &Arc<GatewayShared>,
    connection_id: &str,
    ctrl_tx: &mpsc::Sender<Envelope>,
    session_id: &str,
    command: SessionCommand,
) {
    match shared.registry.route(session_id, connection_id) {
        Ok(cmd_tx) => {
            if cmd_tx.send(command).await.is_err() {
                let _ = ctrl_tx
                    .send(error_frame(
                        Some(session_id),
                        ErrorCode::InvalidState,
                        "session is shutting down",
                    ))
                    .await;
            }
        }
        Err(e) => {
            let _ = ctrl_tx
                .send(error_frame(Some(session_id), e.error_code(), e.to_string()))
                .await;
        }
    }
}
