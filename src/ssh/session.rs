//! Transport seams
//!
//! [`Connector`] opens authenticated sessions and [`RemoteSession`] runs
//! commands on one. Everything above this module talks to the host through
//! these two traits only, so a run can be driven against a fake transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::command::CommandOutput;
use crate::error::Result;

/// How a session was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Key,
    Password,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Key => f.write_str("key"),
            AuthMethod::Password => f.write_str("password"),
        }
    }
}

/// Credentials available for a negotiation
#[derive(Clone)]
pub struct Credentials {
    /// Remote user name
    pub user: String,

    /// Password for password authentication
    pub password: Option<String>,

    /// Parsed private key for public-key authentication
    pub private_key: Option<Arc<russh::keys::PrivateKey>>,
}

impl Credentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            private_key: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_private_key(mut self, key: Option<russh::keys::PrivateKey>) -> Self {
        self.private_key = key.map(Arc::new);
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.is_some())
            .finish()
    }
}

/// A live, authenticated session on the target host
///
/// Owned by exactly one caller; `close` consumes it.
#[async_trait]
pub trait RemoteSession: Send {
    /// Port this session is connected to
    fn port(&self) -> u16;

    /// Authentication method that produced this session
    fn method(&self) -> AuthMethod;

    /// Run `command` and collect its output. A non-zero exit is not an error.
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Write `contents` to `remote_path` on the host
    async fn upload(&mut self, remote_path: &str, contents: &[u8], timeout: Duration)
        -> Result<()>;

    /// Disconnect
    async fn close(self)
    where
        Self: Sized;
}

/// Opens sessions to the target host
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: RemoteSession + 'static;

    /// Whether `host:port` accepts a TCP connection within `timeout`
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// Connect to `host:port` and authenticate with `method`.
    ///
    /// Must return [`SetupError::Authentication`](crate::error::SetupError::Authentication)
    /// when the server rejects the credentials, and a connection error when
    /// the transport itself fails.
    async fn authenticate(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        method: AuthMethod,
    ) -> Result<Self::Session>;
}
