//! Session task
//!
//! One task per session owns the transport and a single-consumer command
//! queue. Commands reach the transport strictly in queue order, which is
//! what keeps a resize from racing an input and keeps a reconnecting
//! connection from interleaving with a still-draining one: `Rebind` travels
//! through the same queue as everything else.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::buffer::{FlowControlConfig, FlowSignal, OutputBuffer};
use super::registry::{RegistryError, SessionRegistry};
use super::state::{SessionState, SessionStateMachine};
use crate::protocol::{
    error_frame, find_utf8_safe_boundary, flow_control_frame, now_millis, session_info_frame,
    status_frame, Envelope, ErrorCode, FlowControlAction, SessionStatus, SessionType, SignalName,
};
use crate::services::{CommandEvent, CommandHistorySink};
use crate::transport::docker::DockerTransport;
use crate::transport::local::LocalTransport;
use crate::transport::ssh::SshDialer;
use crate::transport::{
    KnownHostsStore, OutputReceiver, TerminalSize, Transport, TransportError, TransportEvent,
    TransportParams,
};

/// Commands processed by a session's single-consumer queue.
#[derive(Debug)]
pub enum SessionCommand {
    /// Input bytes for the shell.
    Input(Vec<u8>),
    /// Terminal resize; a no-op when dimensions are unchanged.
    Resize { rows: u16, cols: u16 },
    /// Deliver an allow-listed signal.
    Signal(SignalName),
    /// Graceful teardown with a reason reported to the client.
    Disconnect { reason: String },
    /// Swap the control-frame sink to a reconnected connection.
    Rebind { ctrl_tx: mpsc::Sender<Envelope> },
}

/// Control-frame sink into the owning connection's write loop. Sends are
/// best-effort: an orphaned session simply has nobody listening.
#[derive(Clone)]
pub(crate) struct CtrlSender {
    tx: mpsc::Sender<Envelope>,
}

impl CtrlSender {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    fn send(&self, frame: Envelope) {
        if let Err(e) = self.tx.try_send(frame) {
            debug!("Control frame dropped: {}", e);
        }
    }
}

/// Shared dependencies handed to each spawned session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub known_hosts: Arc<KnownHostsStore>,
    pub history: Arc<dyn CommandHistorySink>,
    pub connect_timeout: Duration,
    pub flow_control: FlowControlConfig,
}

/// Parameters of one `connect` request, already resolved against the
/// profile store.
pub struct SessionParams {
    pub session_type: SessionType,
    pub transport: TransportParams,
    pub size: TerminalSize,
    pub principal_id: String,
    pub connection_id: String,
}

/// Allocate a session, register it, and spawn its task. Returns the new
/// session id; the task reports progress through `ctrl_tx`.
pub fn spawn_session(
    ctx: SessionContext,
    params: SessionParams,
    ctrl_tx: mpsc::Sender<Envelope>,
) -> Result<String, RegistryError> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(128);
    let (buffer, flow_rx) = OutputBuffer::new(ctx.flow_control);
    let state = SessionStateMachine::new();

    let session_id = ctx.registry.register(
        params.session_type,
        params.principal_id.clone(),
        params.connection_id.clone(),
        cmd_tx,
        buffer.clone(),
        state.clone(),
        params.size.rows,
        params.size.cols,
    )?;

    let ctrl = CtrlSender::new(ctrl_tx);
    let id = session_id.clone();
    tokio::spawn(async move {
        run_session(ctx, id, params, state, buffer, flow_rx, cmd_rx, ctrl).await;
    });

    Ok(session_id)
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    ctx: SessionContext,
    session_id: String,
    params: SessionParams,
    state: SessionStateMachine,
    buffer: Arc<OutputBuffer>,
    flow_rx: mpsc::UnboundedReceiver<FlowSignal>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    ctrl: CtrlSender,
) {
    let _ = state.start_connecting();
    ctrl.send(status_frame(&session_id, SessionStatus::Connecting, None));

    let dial = timeout(
        ctx.connect_timeout,
        dial_transport(
            &params.transport,
            params.size,
            &session_id,
            &state,
            &ctrl,
            ctx.known_hosts.clone(),
        ),
    )
    .await;

    let (transport, events) = match dial {
        Err(_) => {
            let message = format!(
                "transport dial exceeded {}s",
                ctx.connect_timeout.as_secs()
            );
            warn!("Session {}: {}", session_id, message);
            let _ = state.fail(ErrorCode::SessionTimeout, message.clone());
            ctrl.send(error_frame(
                Some(&session_id),
                ErrorCode::SessionTimeout,
                message,
            ));
            ctx.registry.remove(&session_id);
            return;
        }
        Ok(Err(e)) => {
            let code = e.error_code();
            warn!("Session {}: dial failed: {}", session_id, e);
            let _ = state.fail(code, e.to_string());
            ctrl.send(error_frame(Some(&session_id), code, e.to_string()));
            ctx.registry.remove(&session_id);
            return;
        }
        Ok(Ok(pair)) => pair,
    };

    let _ = state.mark_ready();
    ctrl.send(status_frame(&session_id, SessionStatus::Ready, None));
    if let Some(descriptor) = ctx.registry.descriptor(&session_id) {
        ctrl.send(session_info_frame(&descriptor));
    }
    let _ = state.activate();

    info!(
        "Session {} ready ({} shell)",
        session_id,
        params.session_type.as_str()
    );

    run_session_loop(
        ctx,
        session_id,
        state,
        buffer,
        flow_rx,
        cmd_rx,
        ctrl,
        transport,
        events,
        (params.size.rows, params.size.cols),
    )
    .await;
}

/// Open the transport variant chosen at connect time, reporting the
/// SSH authentication stage as its own status.
async fn dial_transport(
    params: &TransportParams,
    size: TerminalSize,
    session_id: &str,
    state: &SessionStateMachine,
    ctrl: &CtrlSender,
    known_hosts: Arc<KnownHostsStore>,
) -> Result<(Box<dyn Transport>, OutputReceiver), TransportError> {
    match params {
        TransportParams::Ssh(profile) => {
            let dialer = SshDialer::dial(profile, known_hosts).await?;

            let _ = state.start_authenticating();
            ctrl.send(status_frame(
                session_id,
                SessionStatus::Authenticating,
                None,
            ));

            let authed = dialer.authenticate(profile).await?;
            let (transport, events) = authed.open_shell(size).await?;
            Ok((Box::new(transport), events))
        }
        TransportParams::Local(local) => {
            let (transport, events) = LocalTransport::open(local.clone(), size)?;
            Ok((Box::new(transport), events))
        }
        TransportParams::Docker(docker) => {
            let (transport, events) = DockerTransport::open(docker.clone(), size)?;
            Ok((Box::new(transport), events))
        }
    }
}

/// Spawn the session loop directly on an already-open transport.
#[cfg(test)]
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_session_loop(
    ctx: SessionContext,
    session_id: String,
    state: SessionStateMachine,
    buffer: Arc<OutputBuffer>,
    flow_rx: mpsc::UnboundedReceiver<FlowSignal>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    ctrl: CtrlSender,
    transport: Box<dyn Transport>,
    events: OutputReceiver,
    size: (u16, u16),
) -> JoinHandle<()> {
    tokio::spawn(run_session_loop(
        ctx, session_id, state, buffer, flow_rx, cmd_rx, ctrl, transport, events, size,
    ))
}

#[allow(clippy::too_many_arguments)]
async fn run_session_loop(
    ctx: SessionContext,
    session_id: String,
    state: SessionStateMachine,
    buffer: Arc<OutputBuffer>,
    mut flow_rx: mpsc::UnboundedReceiver<FlowSignal>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut ctrl: CtrlSender,
    transport: Box<dyn Transport>,
    mut events: OutputReceiver,
    mut size: (u16, u16),
) {
    let mut recorder = CommandRecorder::new();
    let mut pending_utf8: Vec<u8> = Vec::new();
    let mut disconnect_reason: Option<String> = None;
    let mut failure: Option<(ErrorCode, String)> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => {
                        disconnect_reason = Some("session released".to_string());
                        break;
                    }
                    Some(SessionCommand::Input(data)) => {
                        if !state.accepts_input() {
                            ctrl.send(error_frame(
                                Some(&session_id),
                                ErrorCode::InvalidState,
                                "session is not accepting input",
                            ));
                            continue;
                        }
                        recorder.feed(&data, &session_id, ctx.history.as_ref());
                        ctx.registry.touch(&session_id);
                        if let Err(e) = transport.write(&data).await {
                            failure = Some((e.error_code(), e.to_string()));
                            break;
                        }
                    }
                    Some(SessionCommand::Resize { rows, cols }) => {
                        if (rows, cols) == size {
                            // Unchanged dimensions are a no-op success.
                            continue;
                        }
                        match transport.resize(rows, cols).await {
                            Ok(()) => {
                                size = (rows, cols);
                                ctx.registry.update_size(&session_id, rows, cols);
                                debug!("Session {} resized to {}x{}", session_id, cols, rows);
                            }
                            Err(e) => {
                                // Resize failures are not session-fatal.
                                warn!("Session {} resize failed: {}", session_id, e);
                            }
                        }
                    }
                    Some(SessionCommand::Signal(signal)) => {
                        if let Err(e) = transport.signal(signal).await {
                            warn!(
                                "Session {} failed to deliver {}: {}",
                                session_id,
                                signal.as_str(),
                                e
                            );
                        }
                    }
                    Some(SessionCommand::Disconnect { reason }) => {
                        disconnect_reason = Some(reason);
                        break;
                    }
                    Some(SessionCommand::Rebind { ctrl_tx }) => {
                        ctrl = CtrlSender::new(ctrl_tx);
                        // Resync the reconnected client.
                        if let Some(descriptor) = ctx.registry.descriptor(&session_id) {
                            ctrl.send(session_info_frame(&descriptor));
                        }
                        if state.state() == SessionState::Paused {
                            ctrl.send(flow_control_frame(&session_id, FlowControlAction::Pause));
                        }
                        info!("Session {} control channel rebound", session_id);
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Some(TransportEvent::Output(data)) => {
                        // Carve at a UTF-8 boundary so no multi-byte
                        // character is split across output frames.
                        let mut combined = if pending_utf8.is_empty() {
                            data
                        } else {
                            let mut joined = std::mem::take(&mut pending_utf8);
                            joined.extend_from_slice(&data);
                            joined
                        };
                        let boundary = find_utf8_safe_boundary(&combined);
                        pending_utf8 = combined.split_off(boundary);
                        if !combined.is_empty() {
                            buffer.push(Bytes::from(combined));
                        }
                        ctx.registry.touch(&session_id);
                    }
                    Some(TransportEvent::Exited(code)) => {
                        disconnect_reason = Some(match code {
                            Some(c) => format!("shell exited with status {}", c),
                            None => "shell exited".to_string(),
                        });
                        break;
                    }
                    None => {
                        failure = Some((
                            ErrorCode::ConnectionFailed,
                            "transport output channel closed".to_string(),
                        ));
                        break;
                    }
                }
            }

            signal = flow_rx.recv() => {
                match signal {
                    Some(FlowSignal::Pause) => {
                        if state.pause().is_ok() {
                            debug!("Session {} paused (high watermark)", session_id);
                            ctrl.send(flow_control_frame(&session_id, FlowControlAction::Pause));
                        }
                    }
                    Some(FlowSignal::Resume) => {
                        if state.resume().is_ok() {
                            debug!("Session {} resumed (low watermark)", session_id);
                            ctrl.send(flow_control_frame(&session_id, FlowControlAction::Resume));
                        }
                    }
                    None => {}
                }
            }
        }
    }

    // Flush whatever tail bytes were waiting for a UTF-8 boundary.
    if !pending_utf8.is_empty() {
        buffer.push(Bytes::from(pending_utf8));
    }

    let _ = transport.close().await;

    match failure {
        Some((code, message)) => {
            let _ = state.fail(code, message.clone());
            ctrl.send(error_frame(Some(&session_id), code, message));
        }
        None => {
            let reason = disconnect_reason.unwrap_or_else(|| "closed".to_string());
            let _ = state.start_disconnecting();
            ctrl.send(status_frame(
                &session_id,
                SessionStatus::Disconnected,
                Some(&reason),
            ));
            let _ = state.mark_closed();
        }
    }

    ctx.registry.remove(&session_id);
    info!("Session {} terminated", session_id);
}

/// Extracts newline-terminated command lines from session input for the
/// command-history sink. Handles simple line editing (backspace, ^C/^U
/// abandoning the line) and ignores other control bytes.
struct CommandRecorder {
    line: Vec<u8>,
}

/// Longest command line the recorder keeps before discarding.
const MAX_RECORDED_LINE: usize = 4096;

impl CommandRecorder {
    fn new() -> Self {
        Self { line: Vec::new() }
    }

    fn feed(&mut self, data: &[u8], session_id: &str, history: &dyn CommandHistorySink) {
        for &byte in data {
            match byte {
                b'\r' | b'\n' => self.flush(session_id, history),
                0x7f | 0x08 => {
                    self.line.pop();
                }
                // ^C and ^U abandon the line being typed.
                0x03 | 0x15 => self.line.clear(),
                _ => {
                    if (!byte.is_ascii_control() || byte >= 0x80)
                        && self.line.len() < MAX_RECORDED_LINE
                    {
                        self.line.push(byte);
                    }
                }
            }
        }
    }

    fn flush(&mut self, session_id: &str, history: &dyn CommandHistorySink) {
        if self.line.is_empty() {
            return;
        }
        let command = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();
        if !command.is_empty() {
            history.record(CommandEvent {
                session_id: session_id.to_string(),
                command,
                at: now_millis(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::buffer::FlowControlConfig;
    use crate::transport::mock::{MockOp, MockTransport};
    use parking_lot::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<CommandEvent>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }
    }

    impl CommandHistorySink for CollectingSink {
        fn record(&self, event: CommandEvent) {
            self.events.lock().push(event);
        }
    }

    struct LoopHarness {
        cmd_tx: mpsc::Sender<SessionCommand>,
        ctrl_rx: mpsc::Receiver<Envelope>,
        ops: Arc<Mutex<Vec<MockOp>>>,
        event_tx: mpsc::Sender<TransportEvent>,
        buffer: Arc<OutputBuffer>,
        handle: JoinHandle<()>,
        session_id: String,
        registry: Arc<SessionRegistry>,
    }

    fn start_loop(history: Arc<dyn CommandHistorySink>) -> LoopHarness {
        let registry = Arc::new(SessionRegistry::new(8, Duration::from_secs(1)));
        let ctx = SessionContext {
            registry: registry.clone(),
            known_hosts: Arc::new(KnownHostsStore::with_path(
                std::env::temp_dir().join("termgate-test-known-hosts"),
            )),
            history,
            connect_timeout: Duration::from_secs(5),
            flow_control: FlowControlConfig {
                high_watermark: 1000,
                low_watermark: 300,
                hard_cap: 2000,
            },
        };

        let (transport, events, event_tx) = MockTransport::open();
        let ops = transport.recorded();
        let (buffer, flow_rx) = OutputBuffer::new(ctx.flow_control);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(256);
        let state = SessionStateMachine::new();
        state.start_connecting().unwrap();
        state.mark_ready().unwrap();
        state.activate().unwrap();

        let session_id = registry
            .register(
                SessionType::Local,
                "alice".to_string(),
                "c1".to_string(),
                cmd_tx.clone(),
                buffer.clone(),
                state.clone(),
                24,
                80,
            )
            .unwrap();

        let handle = spawn_session_loop(
            ctx,
            session_id.clone(),
            state,
            buffer.clone(),
            flow_rx,
            cmd_rx,
            CtrlSender::new(ctrl_tx),
            Box::new(transport),
            events,
            (24, 80),
        );

        LoopHarness {
            cmd_tx,
            ctrl_rx,
            ops,
            event_tx,
            buffer,
            handle,
            session_id,
            registry,
        }
    }

    #[tokio::test]
    async fn test_commands_reach_transport_in_submission_order() {
        let harness = start_loop(CollectingSink::new());

        let mut expected = Vec::new();
        for i in 0..100u32 {
            match i % 3 {
                0 => {
                    let data = format!("input-{}\n", i).into_bytes();
                    expected.push(MockOp::Write(data.clone()));
                    harness
                        .cmd_tx
                        .send(SessionCommand::Input(data))
                        .await
                        .unwrap();
                }
                1 => {
                    let rows = 25 + (i as u16 % 50);
                    let cols = 81 + (i as u16 % 50);
                    expected.push(MockOp::Resize(rows, cols));
                    harness
                        .cmd_tx
                        .send(SessionCommand::Resize { rows, cols })
                        .await
                        .unwrap();
                }
                _ => {
                    expected.push(MockOp::Signal(SignalName::Sigint));
                    harness
                        .cmd_tx
                        .send(SessionCommand::Signal(SignalName::Sigint))
                        .await
                        .unwrap();
                }
            }
        }

        harness
            .cmd_tx
            .send(SessionCommand::Disconnect {
                reason: "test done".to_string(),
            })
            .await
            .unwrap();
        harness.handle.await.unwrap();

        let ops = harness.ops.lock();
        // Trailing Close from teardown; everything before it is ours.
        let observed: Vec<_> = ops
            .iter()
            .filter(|op| !matches!(op, MockOp::Close))
            .cloned()
            .collect();
        assert_eq!(observed, expected);
        drop(ops);

        // Duplicate resizes are dropped as no-ops, so the test used strictly
        // changing sizes; the registry saw the session removed at teardown.
        assert_eq!(harness.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_senders_keep_per_sender_order() {
        let harness = start_loop(CollectingSink::new());

        let tx_a = harness.cmd_tx.clone();
        let a = tokio::spawn(async move {
            for i in 0..50u32 {
                tx_a.send(SessionCommand::Input(format!("a{}\n", i).into_bytes()))
                    .await
                    .unwrap();
            }
        });
        let tx_b = harness.cmd_tx.clone();
        let b = tokio::spawn(async move {
            for i in 0..50u32 {
                tx_b.send(SessionCommand::Input(format!("b{}\n", i).into_bytes()))
                    .await
                    .unwrap();
            }
        });
        a.await.unwrap();
        b.await.unwrap();

        harness
            .cmd_tx
            .send(SessionCommand::Disconnect {
                reason: "test done".to_string(),
            })
            .await
            .unwrap();
        harness.handle.await.unwrap();

        let ops = harness.ops.lock();
        let writes: Vec<String> = ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Write(data) => Some(String::from_utf8_lossy(data).to_string()),
                _ => None,
            })
            .collect();

        // Each sender's own subsequence must appear in submission order.
        for prefix in ["a", "b"] {
            let seen: Vec<&String> = writes
                .iter()
                .filter(|w| w.starts_with(prefix))
                .collect();
            assert_eq!(seen.len(), 50);
            for (i, write) in seen.iter().enumerate() {
                assert_eq!(**write, format!("{}{}\n", prefix, i));
            }
        }
    }

    #[tokio::test]
    async fn test_output_flows_into_buffer_with_utf8_carving() {
        let harness = start_loop(CollectingSink::new());

        // Split a CJK character across two chunks.
        let bytes = "你好".as_bytes();
        harness
            .event_tx
            .send(TransportEvent::Output(bytes[..4].to_vec()))
            .await
            .unwrap();
        harness
            .event_tx
            .send(TransportEvent::Output(bytes[4..].to_vec()))
            .await
            .unwrap();

        // Wait for the loop to process both events.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let drained = harness.buffer.drain(usize::MAX);
        let joined: Vec<u8> = drained.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, bytes);
        // Every drained chunk is valid UTF-8 on its own.
        for chunk in &drained {
            assert!(std::str::from_utf8(chunk).is_ok());
        }

        harness
            .cmd_tx
            .send(SessionCommand::Disconnect {
                reason: "test done".to_string(),
            })
            .await
            .unwrap();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shell_exit_reports_disconnected_status() {
        let mut harness = start_loop(CollectingSink::new());

        harness
            .event_tx
            .send(TransportEvent::Exited(Some(0)))
            .await
            .unwrap();
        harness.handle.await.unwrap();

        let mut saw_disconnected = false;
        while let Ok(frame) = harness.ctrl_rx.try_recv() {
            if frame.kind == "status" && frame.data["status"] == "disconnected" {
                saw_disconnected = true;
                assert_eq!(frame.data["detail"], "shell exited with status 0");
            }
        }
        assert!(saw_disconnected);
        assert_eq!(harness.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_pause_resume_frames_emitted() {
        let mut harness = start_loop(CollectingSink::new());

        // 1200 bytes crosses the 1000-byte high watermark.
        harness
            .event_tx
            .send(TransportEvent::Output(vec![b'x'; 1200]))
            .await
            .unwrap();

        // Wait for the pause frame.
        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let frame = harness.ctrl_rx.recv().await.unwrap();
                if frame.kind == "flow_control" {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(frame.data["action"], "pause");

        // Draining below the low watermark resumes.
        while !harness.buffer.is_empty() {
            harness.buffer.drain(usize::MAX);
        }
        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let frame = harness.ctrl_rx.recv().await.unwrap();
                if frame.kind == "flow_control" {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(frame.data["action"], "resume");

        harness
            .cmd_tx
            .send(SessionCommand::Disconnect {
                reason: "test done".to_string(),
            })
            .await
            .unwrap();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_recorder_extracts_lines() {
        let sink = CollectingSink::new();
        let mut recorder = CommandRecorder::new();

        recorder.feed(b"ls -la\n", "s1", sink.as_ref());
        recorder.feed(b"git sttaus", "s1", sink.as_ref());
        // Fix the typo with backspaces.
        recorder.feed(&[0x08, 0x08, 0x08, 0x08], "s1", sink.as_ref());
        recorder.feed(b"atus\r", "s1", sink.as_ref());
        // An abandoned line records nothing.
        recorder.feed(b"rm -rf /", "s1", sink.as_ref());
        recorder.feed(&[0x03], "s1", sink.as_ref());
        recorder.feed(b"\n", "s1", sink.as_ref());

        let events = sink.events.lock();
        let commands: Vec<&str> = events.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["ls -la", "git status"]);
    }
}
