//! Local shell transport
//!
//! Forks a shell attached to a pseudo-terminal. Resize maps to the PTY
//! winsize ioctl; signals are delivered to the shell's process group.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::pty::{PtyCommand, PtyHandle};
use super::{
    LocalParams, OutputReceiver, TerminalSize, Transport, TransportError, TransportEvent,
    OUTPUT_CHANNEL_CAPACITY,
};
use crate::protocol::SignalName;

#[cfg(unix)]
fn to_nix_signal(signal: SignalName) -> nix::sys::signal::Signal {
    use nix::sys::signal::Signal;
    match signal {
        SignalName::Sigint => Signal::SIGINT,
        SignalName::Sigtstp => Signal::SIGTSTP,
        SignalName::Sigterm => Signal::SIGTERM,
        SignalName::Sigkill => Signal::SIGKILL,
        SignalName::Sigquit => Signal::SIGQUIT,
    }
}

/// Shell to fork when the request does not name one.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Transport over a locally forked shell.
pub struct LocalTransport {
    pty: Arc<PtyHandle>,
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
}

impl LocalTransport {
    /// Fork the shell under a fresh PTY and start the I/O pumps.
    pub fn open(
        params: LocalParams,
        size: TerminalSize,
    ) -> Result<(Self, OutputReceiver), TransportError> {
        let shell = params.shell.unwrap_or_else(default_shell);
        let command = PtyCommand::new(shell);
        Self::open_command(command, size)
    }

    /// Spawn an arbitrary command under a PTY. Shared with the container
    /// adapter, which differs only in the command line.
    pub(crate) fn open_command(
        command: PtyCommand,
        size: TerminalSize,
    ) -> Result<(Self, OutputReceiver), TransportError> {
        let pty = Arc::new(
            PtyHandle::spawn(command, size)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        );

        let running = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);

        // Write pump: input channel -> PTY.
        let pty_write = pty.clone();
        let running_write = running.clone();
        tokio::spawn(async move {
            while running_write.load(Ordering::SeqCst) {
                match input_rx.recv().await {
                    Some(data) => {
                        if let Err(e) = pty_write.write(&data) {
                            tracing::error!("Failed to write to PTY: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            debug!("PTY write pump terminated");
        });

        // Read pump: PTY -> output events. PTY reads block, so this runs on
        // the blocking pool and never stalls the async loops.
        let reader = pty.clone_reader();
        let pty_read = pty.clone();
        let running_read = running.clone();
        tokio::task::spawn_blocking(move || {
            let rt = tokio::runtime::Handle::current();
            let mut buf = [0u8; 8192];

            loop {
                if !running_read.load(Ordering::SeqCst) {
                    debug!("PTY read pump: transport stopped");
                    break;
                }

                let n = {
                    let mut r = match reader.lock() {
                        Ok(r) => r,
                        Err(_) => {
                            tracing::error!("PTY read pump: failed to acquire reader lock");
                            break;
                        }
                    };
                    match r.read(&mut buf) {
                        Ok(0) => {
                            debug!("PTY read pump: EOF");
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::Interrupted
                            {
                                continue;
                            }
                            debug!("PTY read pump error: {}", e);
                            break;
                        }
                    }
                };

                if rt
                    .block_on(event_tx.send(TransportEvent::Output(buf[..n].to_vec())))
                    .is_err()
                {
                    break;
                }
            }

            running_read.store(false, Ordering::SeqCst);
            let exit_code = pty_read.exit_code();
            let _ = rt.block_on(event_tx.send(TransportEvent::Exited(exit_code)));
            debug!("PTY read pump exited (code: {:?})", exit_code);
        });

        Ok((
            Self {
                pty,
                input_tx,
                running,
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), TransportError> {
        self.pty
            .resize(rows, cols)
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    #[cfg(unix)]
    async fn signal(&self, signal: SignalName) -> Result<(), TransportError> {
        self.pty
            .signal_process_group(to_nix_signal(signal))
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    #[cfg(not(unix))]
    async fn signal(&self, _signal: SignalName) -> Result<(), TransportError> {
        Err(TransportError::SignalUnsupported)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pty.kill_process_group();
        Ok(())
    }
}
