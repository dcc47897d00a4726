//! SSH transport module
//!
//! This module provides port negotiation, authentication, and command
//! execution against the target host.

pub mod command;
pub mod connection;
pub mod handler;
pub mod negotiate;
pub mod sanitize;
pub mod session;

// Re-exports
pub use command::{CommandOutput, CommandRunner, Criticality};
pub use connection::{RusshConnector, SshSession};
pub use handler::SshHandler;
pub use negotiate::ConnectionNegotiator;
pub use sanitize::{escape_for_shell, single_quote, validate_command};
pub use session::{AuthMethod, Connector, Credentials, RemoteSession};
