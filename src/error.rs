//! Error types for server-setup

use thiserror::Error;

/// Main error type for a provisioning run
#[derive(Debug, Error)]
pub enum SetupError {
    /// None of the candidate ports accepted a TCP connection
    #[error("Host {host} is not reachable on any of the ports {ports:?}")]
    Connectivity { host: String, ports: Vec<u16> },

    /// SSH transport failed after the port was reachable (handshake, channel, disconnect)
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Neither key nor password authentication succeeded
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A critical remote command exited non-zero
    #[error("Remote command `{command}` failed with exit code {exit_code}: {stderr}")]
    RemoteCommand {
        command: String,
        exit_code: u32,
        stderr: String,
    },

    /// A single package failed to install (recorded, not fatal)
    #[error("Package `{package}` failed to install (exit code {exit_code}): {stderr}")]
    PackageInstall {
        package: String,
        exit_code: u32,
        stderr: String,
    },

    /// A post-install hook failed (recorded, not fatal)
    #[error("Post-install hook `{hook}` for `{package}` failed: {reason}")]
    HookDispatch {
        hook: String,
        package: String,
        reason: String,
    },

    /// Remote command or upload timed out
    #[error("Command timeout after {0}ms")]
    Timeout(u64),

    /// Invalid settings, arguments or assets
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local SSH key could not be generated, read or parsed
    #[error("SSH key error: {0}")]
    SshKey(String),
}

/// Result type alias using SetupError
pub type Result<T> = std::result::Result<T, SetupError>;

impl SetupError {
    /// Create a connection error from a string
    pub fn connection(msg: impl Into<String>) -> Self {
        SetupError::Connection(msg.into())
    }

    /// Create an authentication error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        SetupError::Authentication(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        SetupError::Config(msg.into())
    }

    /// Create an SSH key error from a string
    pub fn ssh_key(msg: impl Into<String>) -> Self {
        SetupError::SshKey(msg.into())
    }

    /// Process exit status reported for this error when it ends a run
    pub fn exit_code(&self) -> u8 {
        match self {
            SetupError::Config(_) => 2,
            SetupError::Connectivity { .. } => 3,
            SetupError::Authentication(_) => 4,
            SetupError::RemoteCommand { .. } => 5,
            _ => 1,
        }
    }

    /// Whether this failure may be recorded while the run continues
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            SetupError::PackageInstall { .. } | SetupError::HookDispatch { .. }
        )
    }
}

impl From<serde_json::Error> for SetupError {
    fn from(err: serde_json::Error) -> Self {
        SetupError::Config(format!("invalid settings document: {}", err))
    }
}
