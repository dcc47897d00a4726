//! Configuration and CLI argument parsing for server-setup

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SetupError};

/// Default timeout for remote command execution in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 900_000; // 15 minutes, apt-get upgrade can be slow

/// TCP probe timeout per candidate port in seconds
pub const PROBE_TIMEOUT_SECS: u64 = 2;

/// SSH handshake + authentication timeout in seconds
pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Default location of the settings document
pub const DEFAULT_SETTINGS_PATH: &str = "custom_files/settings.json";

/// Default local working directory (log file, rendered firewall)
pub const DEFAULT_INSTANCE_DIR: &str = "instance";

/// Default private key file name under `~/.ssh`
pub const DEFAULT_KEY_NAME: &str = "id_ed25519";

/// server-setup CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "server-setup")]
#[command(author = "TirsvadCLI")]
#[command(version)]
#[command(about = "Bootstrap and harden a fresh Debian host over SSH")]
pub struct Args {
    /// Path to the settings document (a template is written here when missing)
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH, env = "SERVER_SETUP_SETTINGS")]
    pub settings: PathBuf,

    /// Local working directory for the log file and rendered firewall rules
    #[arg(long, default_value = DEFAULT_INSTANCE_DIR, env = "SERVER_SETUP_INSTANCE_DIR")]
    pub instance_dir: PathBuf,

    /// Private key used for key authentication (generated when missing).
    /// Default: ~/.ssh/id_ed25519
    #[arg(long, env = "SERVER_SETUP_KEY")]
    pub key: Option<PathBuf>,

    /// nftables template overriding the built-in one
    #[arg(long, env = "SERVER_SETUP_FIREWALL_TEMPLATE")]
    pub firewall_template: Option<PathBuf>,

    /// Remote command execution timeout in milliseconds
    #[arg(long, default_value = "900000", env = "SERVER_SETUP_TIMEOUT")]
    pub timeout: u64,

    /// Log debug output to stderr
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,

    /// Do not print step progress
    #[arg(short, long, default_value = "false", env = "SERVER_SETUP_QUIET")]
    pub quiet: bool,
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings document path
    pub settings_path: PathBuf,

    /// Local working directory
    pub instance_dir: PathBuf,

    /// Private key path; the public key is `<path>.pub`
    pub key_path: PathBuf,

    /// Optional firewall template override
    pub firewall_template: Option<PathBuf>,

    /// Remote command timeout
    pub command_timeout: Duration,

    /// Debug logging on stderr
    pub verbose: bool,

    /// Progress output disabled
    pub quiet: bool,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        validate_args(&args)?;

        let key_path = match args.key {
            Some(path) => path,
            None => default_key_path()?,
        };

        Ok(Config {
            settings_path: args.settings,
            instance_dir: args.instance_dir,
            key_path,
            firewall_template: args.firewall_template,
            command_timeout: Duration::from_millis(args.timeout),
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Path of the run log inside the instance directory
    pub fn log_path(&self) -> PathBuf {
        self.instance_dir.join("setup.log")
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args) -> Result<()> {
    let mut errors = Vec::new();

    if args.timeout == 0 {
        errors.push("--timeout must be greater than zero".to_string());
    }

    if args.settings.as_os_str().is_empty() {
        errors.push("--settings must not be empty".to_string());
    }

    if let Some(ref template) = args.firewall_template {
        if !template.exists() {
            errors.push(format!(
                "Firewall template not found: {}",
                template.display()
            ));
        }
    }

    if args.verbose && args.quiet {
        errors.push("--verbose and --quiet are mutually exclusive".to_string());
    }

    if !errors.is_empty() {
        return Err(SetupError::Config(format!(
            "Invalid arguments:\n{}",
            errors.join("\n")
        )));
    }

    Ok(())
}

/// `~/.ssh/id_ed25519` for the current user
fn default_key_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SetupError::config("cannot determine home directory for --key"))?;
    Ok(home.join(".ssh").join(DEFAULT_KEY_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["server-setup", "--key", "/tmp/test_key"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(args(&[])).unwrap();
        assert_eq!(config.settings_path, PathBuf::from(DEFAULT_SETTINGS_PATH));
        assert_eq!(config.instance_dir, PathBuf::from(DEFAULT_INSTANCE_DIR));
        assert_eq!(config.key_path, PathBuf::from("/tmp/test_key"));
        assert_eq!(
            config.command_timeout,
            Duration::from_millis(DEFAULT_TIMEOUT_MS)
        );
        assert_eq!(config.log_path(), PathBuf::from("instance/setup.log"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = Config::from_args(args(&["--timeout", "0"]));
        assert!(result.unwrap_err().to_string().contains("--timeout"));
    }

    #[test]
    fn test_missing_template_rejected() {
        let result = Config::from_args(args(&[
            "--firewall-template",
            "/nonexistent/nftables.conf",
        ]));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Firewall template not found"));
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        let result = Config::from_args(args(&["--verbose", "--quiet"]));
        assert!(result.is_err());
    }
}
