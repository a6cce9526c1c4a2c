//! SSH transport adapter
//!
//! Dials a remote host with russh, verifies its key against the known-hosts
//! store, authenticates, and allocates a remote PTY with a shell. The open
//! channel is owned by a dedicated task commanded over mpsc, so the adapter
//! handle stays cheap to share.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{ChannelMsg, Sig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::{
    OutputReceiver, TerminalSize, Transport, TransportError, TransportEvent,
    OUTPUT_CHANNEL_CAPACITY,
};
use crate::protocol::SignalName;

/// SSH connection parameters, resolved from a profile reference by the
/// profile store. Credentials are never persisted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshProfile {
    pub host: String,
    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuthMethod,
    /// Reject unknown host keys instead of trusting on first use.
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_port() -> u16 {
    22
}

/// Authentication method for an SSH profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuthMethod {
    Password { password: String },
    Key {
        key_path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

/// Commands accepted by the channel owner task.
#[derive(Debug)]
enum ChannelCommand {
    Data(Vec<u8>),
    Resize(u16, u16),
    Signal(SignalName),
    Close,
}

fn to_ssh_sig(signal: SignalName) -> Sig {
    match signal {
        SignalName::Sigint => Sig::INT,
        SignalName::Sigterm => Sig::TERM,
        SignalName::Sigkill => Sig::KILL,
        SignalName::Sigquit => Sig::QUIT,
        // Not part of russh's named set; the wire name minus the SIG prefix.
        SignalName::Sigtstp => Sig::Custom("TSTP".to_string()),
    }
}

/// Client handler for russh callbacks: host key verification against the
/// known-hosts store.
pub struct ClientHandler {
    host: String,
    port: u16,
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
}

impl client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let verification = self
            .known_hosts
            .verify(&self.host, self.port, server_public_key);

        match verification {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), strict mode rejects",
                        self.host, self.port, fingerprint
                    );
                    Err(TransportError::ConnectionFailed(format!(
                        "host key verification failed: unknown host {}:{} (fingerprint: {})",
                        self.host, self.port, fingerprint
                    )))
                } else {
                    // Trust on first use and persist.
                    info!(
                        "New host {}:{}, adding to known_hosts (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) =
                        self.known_hosts
                            .add_host(&self.host, self.port, server_public_key)
                    {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(TransportError::HostKeyChanged(format!(
                    "{}:{} (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

/// A dialed-but-unauthenticated SSH connection. The two-step shape lets the
/// session layer report `connecting` and `authenticating` separately.
pub struct SshDialer {
    handle: client::Handle<ClientHandler>,
}

impl SshDialer {
    /// Resolve the address and complete the SSH handshake, including host
    /// key verification.
    pub async fn dial(
        profile: &SshProfile,
        known_hosts: Arc<KnownHostsStore>,
    ) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", profile.host, profile.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("failed to resolve {}: {}", addr, e))
            })?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no address found for {}", addr))
            })?;

        let config = client::Config {
            // Session-level liveness is handled by the gateway keepalive;
            // SSH-level keepalive covers the transport hop.
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler {
            host: profile.host.clone(),
            port: profile.port,
            strict: profile.strict_host_key_checking,
            known_hosts,
        };

        let handle = client::connect(Arc::new(config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                TransportError::HostKeyChanged(_) => e,
                TransportError::ConnectionFailed(_) => e,
                other => TransportError::ConnectionFailed(other.to_string()),
            })?;

        debug!("SSH handshake completed for {}", addr);
        Ok(Self { handle })
    }

    /// Authenticate with the profile's credentials.
    pub async fn authenticate(mut self, profile: &SshProfile) -> Result<AuthedSsh, TransportError> {
        let authenticated = match &profile.auth {
            SshAuthMethod::Password { password } => self
                .handle
                .authenticate_password(&profile.username, password)
                .await
                .map_err(|e| TransportError::AuthFailed(e.to_string()))?,
            SshAuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| TransportError::AuthFailed(format!("key load failed: {}", e)))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                self.handle
                    .authenticate_publickey(&profile.username, key_with_hash)
                    .await
                    .map_err(|e| TransportError::AuthFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(TransportError::AuthFailed(
                "authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", profile.host);
        Ok(AuthedSsh {
            handle: self.handle,
        })
    }
}

/// An authenticated SSH connection, ready to allocate a shell.
pub struct AuthedSsh {
    handle: client::Handle<ClientHandler>,
}

impl AuthedSsh {
    /// Request a remote PTY plus shell and spawn the channel owner task.
    pub async fn open_shell(
        self,
        size: TerminalSize,
    ) -> Result<(SshTransport, OutputReceiver), TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("channel open failed: {}", e)))?;

        channel
            .request_pty(
                false,
                "xterm-256color",
                size.cols as u32,
                size.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| TransportError::Protocol(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::Protocol(format!("shell request failed: {}", e)))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(OUTPUT_CHANNEL_CAPACITY);

        // Channel owner task: the only holder of the russh channel. Commands
        // arrive strictly in queue order; output is pushed to the event
        // channel as it arrives.
        let _handle = self.handle;
        tokio::spawn(async move {
            let mut exit_code: Option<i32> = None;

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(ChannelCommand::Data(data)) => {
                                if let Err(e) = channel.data(&data[..]).await {
                                    error!("Failed to send data to SSH channel: {}", e);
                                    break;
                                }
                            }
                            Some(ChannelCommand::Resize(rows, cols)) => {
                                if let Err(e) = channel
                                    .window_change(cols as u32, rows as u32, 0, 0)
                                    .await
                                {
                                    // Resize failures are not fatal.
                                    warn!("Failed to resize remote PTY: {}", e);
                                } else {
                                    debug!("Remote PTY resized to {}x{}", cols, rows);
                                }
                            }
                            Some(ChannelCommand::Signal(signal)) => {
                                if let Err(e) = channel.signal(to_ssh_sig(signal)).await {
                                    warn!("Failed to deliver {} over SSH: {}", signal.as_str(), e);
                                }
                            }
                            Some(ChannelCommand::Close) | None => {
                                let _ = channel.eof().await;
                                break;
                            }
                        }
                    }

                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                if event_tx.send(TransportEvent::Output(data.to_vec())).await.is_err() {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExtendedData { data, ext }) => {
                                // ext == 1 is stderr; merge into the output stream.
                                if ext == 1
                                    && event_tx
                                        .send(TransportEvent::Output(data.to_vec()))
                                        .await
                                        .is_err()
                                {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                exit_code = Some(exit_status as i32);
                            }
                            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                                debug!("SSH channel exit signal {:?}", signal_name);
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
            }

            let _ = event_tx.send(TransportEvent::Exited(exit_code)).await;
            debug!("SSH channel owner task terminated");
        });

        Ok((SshTransport { cmd_tx }, event_rx))
    }
}

/// Handle to an open SSH shell channel.
pub struct SshTransport {
    cmd_tx: mpsc::Sender<ChannelCommand>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::Data(data.to_vec()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::Resize(rows, cols))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn signal(&self, signal: SignalName) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::Signal(signal))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Already-closed is fine; close is idempotent.
        let _ = self.cmd_tx.send(ChannelCommand::Close).await;
        Ok(())
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        // Best-effort: make sure the owner task releases the channel.
        let _ = self.cmd_tx.try_send(ChannelCommand::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        assert!(matches!(to_ssh_sig(SignalName::Sigint), Sig::INT));
        assert!(matches!(to_ssh_sig(SignalName::Sigkill), Sig::KILL));
        match to_ssh_sig(SignalName::Sigtstp) {
            Sig::Custom(name) => assert_eq!(name, "TSTP"),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn test_profile_deserialization() {
        let profile: SshProfile = serde_json::from_str(
            r#"{
                "host": "example.com",
                "username": "deploy",
                "auth": {"method": "password", "password": "secret"}
            }"#,
        )
        .unwrap();
        assert_eq!(profile.port, 22);
        assert!(!profile.strict_host_key_checking);
        assert!(matches!(profile.auth, SshAuthMethod::Password { .. }));
    }
}
