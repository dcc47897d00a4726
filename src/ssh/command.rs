//! Remote command execution
//!
//! Provides the `CommandOutput` struct and [`CommandRunner`], which runs one
//! command at a time on a [`RemoteSession`] and applies the caller's
//! criticality to the exit status.

use std::time::Duration;

use tracing::{debug, warn};

use super::sanitize::validate_command;
use super::session::RemoteSession;
use crate::error::{Result, SetupError};

/// Output from a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if available)
    pub exit_code: Option<u32>,

    /// Signal that terminated the command, if any
    pub exit_signal: Option<String>,
}

impl CommandOutput {
    /// Create a new empty CommandOutput
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of a command that exited with `code`
    pub fn with_exit_code(code: u32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Check if the command exited with status 0.
    ///
    /// A command that was killed by a signal or reported no exit status
    /// did not succeed.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.exit_signal.is_none()
    }

    /// Why the command failed, for error messages
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let cause = match (&self.exit_signal, self.exit_code) {
            (Some(signal), _) => format!("terminated by signal {}", signal),
            (None, None) => "no exit status reported".to_string(),
            (None, Some(_)) => return stderr.to_string(),
        };
        if stderr.is_empty() {
            cause
        } else {
            format!("{}: {}", cause, stderr)
        }
    }
}

/// Whether a non-zero exit ends the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Critical,
    BestEffort,
}

/// Runs commands on a session under a fixed timeout
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a command and return its output whatever the exit status
    pub async fn run(
        &self,
        session: &mut dyn RemoteSession,
        command: &str,
    ) -> Result<CommandOutput> {
        let command = validate_command(command)?;
        debug!("ssh -p {} [{}] {}", session.port(), session.method(), command);

        let output = session.exec(command, self.timeout).await?;

        if !output.success() {
            debug!(
                "Command exited with {:?}: {}",
                output.exit_code,
                output.failure_detail()
            );
        }
        Ok(output)
    }

    /// Run a command whose non-zero exit is fatal to the run
    pub async fn run_critical(
        &self,
        session: &mut dyn RemoteSession,
        command: &str,
    ) -> Result<CommandOutput> {
        self.run_with(session, command, Criticality::Critical).await
    }

    /// Run a command tagged with `criticality`.
    ///
    /// Critical failures become [`SetupError::RemoteCommand`]; best-effort
    /// failures are logged and returned as output for the caller to record.
    pub async fn run_with(
        &self,
        session: &mut dyn RemoteSession,
        command: &str,
        criticality: Criticality,
    ) -> Result<CommandOutput> {
        let output = self.run(session, command).await?;
        if output.success() {
            return Ok(output);
        }

        match criticality {
            Criticality::Critical => Err(SetupError::RemoteCommand {
                command: command.to_string(),
                exit_code: output.exit_code.unwrap_or_default(),
                stderr: output.failure_detail(),
            }),
            Criticality::BestEffort => {
                warn!(
                    "Best-effort command `{}` failed: exit {:?}, {}",
                    command,
                    output.exit_code,
                    output.failure_detail()
                );
                Ok(output)
            }
        }
    }
}
