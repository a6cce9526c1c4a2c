//! PTY (pseudo-terminal) layer
//!
//! Wraps portable-pty behind a thread-safe handle. Backs both the local
//! shell adapter and the container exec adapter, which differ only in the
//! command they spawn.

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use super::TerminalSize;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Error type for PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to create PTY: {0}")]
    CreateFailed(String),

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("PTY system error: {0}")]
    PtySystemError(String),

    #[error("Lock error")]
    LockError,
}

/// Command to run under a fresh PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Thread-safe PTY handle.
///
/// MasterPty is not Sync, so all parts live behind standard mutexes and
/// every operation goes through this wrapper.
pub struct PtyHandle {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    child: StdMutex<Box<dyn portable_pty::Child + Send + Sync>>,
    reader: Arc<StdMutex<Box<dyn Read + Send>>>,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
}

// Safety: all fields are behind StdMutex, which provides the required
// synchronization.
unsafe impl Sync for PtyHandle {}

impl PtyHandle {
    /// Spawn a command attached to a new PTY of the given size.
    pub fn spawn(command: PtyCommand, size: TerminalSize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::CreateFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        for arg in &command.args {
            cmd.arg(arg);
        }

        if let Some(cwd) = &command.cwd {
            cmd.cwd(cwd);
        } else if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }

        // Inherit the current environment, then set terminal identity.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        tracing::info!(
            "Spawning PTY command: {} {:?} ({}x{})",
            command.program,
            command.args,
            size.cols,
            size.rows
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            tracing::error!("Failed to spawn PTY command: {}", e);
            PtyError::SpawnFailed(e.to_string())
        })?;

        tracing::debug!("PTY command spawned, PID: {:?}", child.process_id());

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::PtySystemError(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::PtySystemError(format!("Failed to take writer: {}", e)))?;

        Ok(Self {
            master: StdMutex::new(pair.master),
            child: StdMutex::new(child),
            reader: Arc::new(StdMutex::new(reader)),
            writer: Arc::new(StdMutex::new(writer)),
        })
    }

    /// Resize the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let master = self.master.lock().map_err(|_| PtyError::LockError)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::PtySystemError(e.to_string()))
    }

    /// Write input bytes to the PTY.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut writer = self.writer.lock().map_err(|_| PtyError::LockError)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Clone of the reader Arc for spawning read pumps.
    pub fn clone_reader(&self) -> Arc<StdMutex<Box<dyn Read + Send>>> {
        self.reader.clone()
    }

    /// Check if the child process is still running.
    pub fn is_alive(&self) -> bool {
        if let Ok(mut child) = self.child.lock() {
            matches!(child.try_wait(), Ok(None))
        } else {
            false
        }
    }

    /// Exit code if the child has terminated.
    pub fn exit_code(&self) -> Option<i32> {
        if let Ok(mut child) = self.child.lock() {
            match child.try_wait() {
                Ok(Some(status)) => Some(status.exit_code() as i32),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Deliver a signal to the child's process group.
    ///
    /// The child is its own session leader, so the PID doubles as the PGID
    /// and foreground children (vim, pagers) receive the signal too.
    #[cfg(unix)]
    pub fn signal_process_group(&self, signal: Signal) -> Result<(), PtyError> {
        let pid = self
            .pid()
            .ok_or_else(|| PtyError::PtySystemError("child already exited".to_string()))?;

        let pgid = Pid::from_raw(pid as i32);
        killpg(pgid, signal)
            .map_err(|e| PtyError::PtySystemError(format!("killpg({}) failed: {}", pid, e)))
    }

    /// Kill the child process.
    pub fn kill(&self) -> Result<(), PtyError> {
        tracing::info!("Killing PTY child process (PID: {:?})", self.pid());
        let mut child = self.child.lock().map_err(|_| PtyError::LockError)?;
        child
            .kill()
            .map_err(|e| PtyError::PtySystemError(e.to_string()))
    }

    /// Kill the entire process group so nested children do not linger.
    #[cfg(unix)]
    pub fn kill_process_group(&self) -> Result<(), PtyError> {
        if let Some(pid) = self.pid() {
            tracing::debug!("Killing process group for PID {}", pid);

            let pgid = Pid::from_raw(pid as i32);

            // SIGTERM first for a graceful shutdown window.
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
            }

            std::thread::sleep(std::time::Duration::from_millis(50));

            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                // The process may have already exited, which is fine.
                tracing::debug!("SIGKILL to process group {}: {}", pid, e);
            }

            Ok(())
        } else {
            self.kill()
        }
    }

    #[cfg(not(unix))]
    pub fn kill_process_group(&self) -> Result<(), PtyError> {
        self.kill()
    }

    /// Process ID of the child.
    pub fn pid(&self) -> Option<u32> {
        if let Ok(child) = self.child.lock() {
            child.process_id()
        } else {
            None
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        tracing::debug!("Dropping PTY, killing process group");
        let _ = self.kill_process_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_command_builder() {
        let cmd = PtyCommand::new("docker")
            .arg("exec")
            .args(["-it", "box", "/bin/sh"]);
        assert_eq!(cmd.program, "docker");
        assert_eq!(cmd.args, vec!["exec", "-it", "box", "/bin/sh"]);
    }

    // PTY spawn tests require a real terminal environment; the adapters'
    // behavior is covered through the local transport tests.
}
