//! russh-backed transport
//!
//! [`RusshConnector`] probes ports and opens authenticated sessions;
//! [`SshSession`] runs commands and uploads files over exec channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{Algorithm, HashAlg, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::command::CommandOutput;
use super::handler::SshHandler;
use super::sanitize::single_quote;
use super::session::{AuthMethod, Connector, Credentials, RemoteSession};
use crate::config::CONNECTION_TIMEOUT_SECS;
use crate::error::{Result, SetupError};

/// Opens russh sessions
#[derive(Debug, Clone)]
pub struct RusshConnector {
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Connect and complete the SSH handshake
    async fn handshake(&self, host: &str, port: u16) -> Result<Handle<SshHandler>> {
        let ssh_config = Arc::new(client::Config::default());
        let addr = format!("{}:{}", host, port);

        match timeout(
            self.connect_timeout,
            client::connect(ssh_config, addr.as_str(), SshHandler::new(host)),
        )
        .await
        {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => {
                error!("SSH connection to {} failed: {}", addr, e);
                Err(SetupError::connection(e.to_string()))
            }
            Err(_) => {
                error!("SSH connection to {} timed out", addr);
                Err(SetupError::connection(format!(
                    "Connection timeout after {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        }
    }

    /// Run one authentication method on an established handle
    async fn try_auth(
        &self,
        handle: &mut Handle<SshHandler>,
        credentials: &Credentials,
        method: AuthMethod,
    ) -> Result<()> {
        let auth = async {
            match method {
                AuthMethod::Key => {
                    let key = credentials
                        .private_key
                        .clone()
                        .ok_or_else(|| SetupError::auth("no private key available"))?;
                    debug!("Attempting key authentication for user '{}'", credentials.user);
                    let hash_alg = signature_hash(&key.algorithm());
                    handle
                        .authenticate_publickey(
                            &credentials.user,
                            PrivateKeyWithHashAlg::new(key, hash_alg),
                        )
                        .await
                        .map_err(|e| SetupError::connection(e.to_string()))
                }
                AuthMethod::Password => {
                    let password = credentials
                        .password
                        .as_deref()
                        .ok_or_else(|| SetupError::auth("no admin password configured"))?;
                    debug!(
                        "Attempting password authentication for user '{}'",
                        credentials.user
                    );
                    handle
                        .authenticate_password(&credentials.user, password)
                        .await
                        .map_err(|e| SetupError::connection(e.to_string()))
                }
            }
        };

        let result = timeout(self.connect_timeout, auth)
            .await
            .map_err(|_| SetupError::connection(format!("{} authentication timed out", method)))??;

        if result.success() {
            Ok(())
        } else {
            Err(SetupError::auth(format!("{} authentication rejected", method)))
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RusshConnector {
    type Session = SshSession;

    async fn probe(&self, host: &str, port: u16, probe_timeout: Duration) -> bool {
        match timeout(probe_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("Probe {}:{} refused: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!("Probe {}:{} timed out", host, port);
                false
            }
        }
    }

    async fn authenticate(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        method: AuthMethod,
    ) -> Result<SshSession> {
        info!("Connecting to {}@{}:{} ({})", credentials.user, host, port, method);
        let mut handle = self.handshake(host, port).await?;

        if let Err(e) = self.try_auth(&mut handle, credentials, method).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            return Err(e);
        }

        info!(
            "Authenticated to {}@{}:{} with {}",
            credentials.user, host, port, method
        );
        Ok(SshSession {
            handle,
            port,
            method,
        })
    }
}

/// An authenticated russh session
pub struct SshSession {
    handle: Handle<SshHandler>,
    port: u16,
    method: AuthMethod,
}

impl SshSession {
    /// Open a new session channel
    async fn open_channel(&self) -> Result<Channel<client::Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SetupError::connection(format!("Failed to open channel: {}", e)))
    }

    /// Run `command` on a fresh channel, optionally feeding `stdin`.
    ///
    /// The channel is closed on every path out of this function.
    async fn exec_channel(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout_duration: Duration,
    ) -> Result<CommandOutput> {
        let mut channel = self.open_channel().await?;

        let result = timeout(timeout_duration, async {
            channel
                .exec(true, command)
                .await
                .map_err(|e| SetupError::connection(format!("Failed to exec command: {}", e)))?;

            if let Some(data) = stdin {
                channel
                    .data(data)
                    .await
                    .map_err(|e| SetupError::connection(format!("Failed to send data: {}", e)))?;
                channel
                    .eof()
                    .await
                    .map_err(|e| SetupError::connection(format!("Failed to send EOF: {}", e)))?;
            }

            collect_channel_output(&mut channel).await
        })
        .await;

        if let Err(e) = channel.close().await {
            debug!("Channel close after command: {}", e);
        }

        match result {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    "Command timed out after {}ms: {}",
                    timeout_duration.as_millis(),
                    command
                );
                Err(SetupError::Timeout(timeout_duration.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn port(&self) -> u16 {
        self.port
    }

    fn method(&self) -> AuthMethod {
        self.method
    }

    async fn exec(&mut self, command: &str, timeout_duration: Duration) -> Result<CommandOutput> {
        self.exec_channel(command, None, timeout_duration).await
    }

    async fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        timeout_duration: Duration,
    ) -> Result<()> {
        info!("Uploading {} bytes to {}", contents.len(), remote_path);
        let command = format!("cat > {}", single_quote(remote_path));
        let output = self
            .exec_channel(&command, Some(contents), timeout_duration)
            .await?;

        if !output.success() {
            return Err(SetupError::RemoteCommand {
                command,
                exit_code: output.exit_code.unwrap_or_default(),
                stderr: output.failure_detail(),
            });
        }
        Ok(())
    }

    async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            debug!("Disconnect: {}", e);
        }
        info!("SSH connection on port {} closed", self.port);
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("port", &self.port)
            .field("method", &self.method)
            .finish()
    }
}

/// Collect output from a channel until it closes
async fn collect_channel_output(channel: &mut Channel<client::Msg>) -> Result<CommandOutput> {
    let mut output = CommandOutput::new();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                output.stdout.push_str(&String::from_utf8_lossy(&data));
            }
            ChannelMsg::ExtendedData { data, ext } => {
                // ext == 1 is stderr
                if ext == 1 {
                    output.stderr.push_str(&String::from_utf8_lossy(&data));
                } else {
                    output.stdout.push_str(&String::from_utf8_lossy(&data));
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                output.exit_code = Some(exit_status);
            }
            ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            } => {
                warn!("Remote command terminated by {:?}: {}", signal_name, error_message);
                output.exit_signal = Some(format!("{:?}", signal_name));
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    debug!(
        "Command completed: exit_code={:?}, stdout_len={}, stderr_len={}",
        output.exit_code,
        output.stdout.len(),
        output.stderr.len()
    );

    Ok(output)
}

/// RSA keys sign with rsa-sha2-512; servers reject legacy ssh-rsa (SHA-1)
fn signature_hash(algorithm: &Algorithm) -> Option<HashAlg> {
    match algorithm {
        Algorithm::Rsa { .. } => Some(HashAlg::Sha512),
        _ => None,
    }
}
