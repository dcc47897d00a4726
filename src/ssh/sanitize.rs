//! Command validation and shell quoting utilities

use crate::error::{Result, SetupError};

/// Validate a command before execution
///
/// Trims whitespace and rejects empty commands.
///
/// # Examples
/// ```
/// use server_setup::ssh::sanitize::validate_command;
///
/// assert_eq!(validate_command("  systemctl restart ssh ").unwrap(), "systemctl restart ssh");
/// assert!(validate_command("   ").is_err());
/// ```
pub fn validate_command(command: &str) -> Result<&str> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(SetupError::config("Command cannot be empty"));
    }

    Ok(trimmed)
}

/// Escapes a string for safe use in single-quoted shell contexts.
///
/// Replaces single quotes with `'"'"'`: end quote, add a literal quote via
/// double quotes, start quote again.
///
/// # Examples
///
/// ```
/// use server_setup::ssh::sanitize::escape_for_shell;
///
/// assert_eq!(escape_for_shell("hello"), "hello");
/// assert_eq!(escape_for_shell("it's"), "it'\"'\"'s");
/// ```
pub fn escape_for_shell(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Wrap `s` in single quotes, escaping embedded quotes
///
/// ```
/// use server_setup::ssh::sanitize::single_quote;
///
/// assert_eq!(single_quote("/etc/nftables.conf"), "'/etc/nftables.conf'");
/// ```
pub fn single_quote(s: &str) -> String {
    format!("'{}'", escape_for_shell(s))
}
