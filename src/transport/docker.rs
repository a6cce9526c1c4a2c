//! Container exec transport
//!
//! Attaches to a container's exec stream by running `docker exec -it` under
//! the same PTY layer the local adapter uses, so resize propagates through
//! the runtime's TTY plumbing. Signals map to the runtime's kill API.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::local::LocalTransport;
use super::pty::PtyCommand;
use super::{
    DockerParams, OutputReceiver, TerminalSize, Transport, TransportError,
};
use crate::protocol::SignalName;

/// Shell exec'd inside the container when the request does not name one.
const DEFAULT_CONTAINER_SHELL: &str = "/bin/sh";

/// Transport over a container exec stream.
pub struct DockerTransport {
    inner: LocalTransport,
    container_id: String,
}

impl DockerTransport {
    /// Attach an interactive exec to the container and start the I/O pumps.
    pub fn open(
        params: DockerParams,
        size: TerminalSize,
    ) -> Result<(Self, OutputReceiver), TransportError> {
        let shell = params
            .shell
            .unwrap_or_else(|| DEFAULT_CONTAINER_SHELL.to_string());

        let command = PtyCommand::new("docker")
            .arg("exec")
            .arg("-it")
            .arg(&params.container_id)
            .arg(shell);

        let (inner, events) = LocalTransport::open_command(command, size)?;

        Ok((
            Self {
                inner,
                container_id: params.container_id,
            },
            events,
        ))
    }
}

#[async_trait]
impl Transport for DockerTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write(data).await
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), TransportError> {
        // The docker CLI forwards SIGWINCH to the exec instance, so resizing
        // the local PTY is the exec-resize API.
        self.inner.resize(rows, cols).await
    }

    async fn signal(&self, signal: SignalName) -> Result<(), TransportError> {
        // Delivered through the runtime so the in-container process sees it.
        let status = Command::new("docker")
            .arg("kill")
            .arg("--signal")
            .arg(signal.as_str())
            .arg(&self.container_id)
            .output()
            .await
            .map_err(|e| TransportError::Protocol(format!("docker kill failed: {}", e)))?;

        if !status.status.success() {
            let stderr = String::from_utf8_lossy(&status.stderr);
            warn!(
                "docker kill --signal {} {} failed: {}",
                signal.as_str(),
                self.container_id,
                stderr.trim()
            );
            return Err(TransportError::Protocol(format!(
                "docker kill rejected: {}",
                stderr.trim()
            )));
        }

        debug!(
            "Delivered {} to container {}",
            signal.as_str(),
            self.container_id
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_command_line() {
        let command = PtyCommand::new("docker")
            .arg("exec")
            .arg("-it")
            .arg("box1")
            .arg(DEFAULT_CONTAINER_SHELL);
        assert_eq!(command.program, "docker");
        assert_eq!(command.args, vec!["exec", "-it", "box1", "/bin/sh"]);
    }
}
