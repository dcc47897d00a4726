//! server-setup - bootstrap and harden a fresh Debian host over SSH
//!
//! One run takes a host that is reachable with an administrator password on
//! the stock SSH port and leaves it answering only on the configured port,
//! with key authentication, an nftables firewall and the requested packages.
//!
//! # Flow
//!
//! - Ensure a local Ed25519 key pair exists
//! - Probe the pre-setup and hardened ports, authenticate by key or password
//! - On a fresh host: copy the public key, update the OS, rewrite
//!   `sshd_config` and reconnect on the hardened port
//! - Upload and activate the firewall ruleset
//! - Install packages and run their post-install hooks
//!
//! Re-running against an already hardened host skips straight to the
//! firewall and package steps.
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! server-setup --settings custom_files/settings.json --verbose
//! ```

pub mod config;
pub mod error;
pub mod firewall;
pub mod hardening;
pub mod installer;
pub mod keys;
pub mod orchestrator;
pub mod progress;
pub mod settings;
pub mod ssh;

// Re-exports for convenience
pub use config::{Args, Config};
pub use error::{Result, SetupError};
pub use firewall::{FirewallProvisioner, FirewallRuleset, ServiceRules};
pub use hardening::HardeningPlan;
pub use installer::{AppInstaller, AppOutcome, HookOutcome, HookRegistry, PostInstallHook};
pub use keys::LocalKeyPair;
pub use orchestrator::{Orchestrator, RunReport, RunState};
pub use progress::Progress;
pub use settings::{AppSpec, HostTarget, Settings, SettingsLoad, SshdPolicy};
pub use ssh::{
    AuthMethod, CommandOutput, CommandRunner, ConnectionNegotiator, Connector, Credentials,
    RemoteSession, RusshConnector, SshSession,
};
