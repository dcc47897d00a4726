//! Provisioning run
//!
//! Sequences one run against one host:
//!
//! ```text
//! Start → KeyEnsured → PortSelected → Authenticated
//!   ├─ on the pre-setup port: KeyProvisioned → OsUpdated → Hardened
//!   │                         → PortSelected → Reauthenticated
//!   └─ already on the hardened port: OsUpdateSkipped
//! → FirewallReady → AppsInstalled → Done
//! ```
//!
//! Any critical failure ends the run in `Failed`. Package and hook failures
//! are collected in the [`RunReport`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::PROBE_TIMEOUT_SECS;
use crate::error::{Result, SetupError};
use crate::firewall::{self, FirewallProvisioner, FirewallRuleset};
use crate::hardening;
use crate::installer::{AppInstaller, AppOutcome, HookOutcome, HookRegistry};
use crate::keys::LocalKeyPair;
use crate::progress::Progress;
use crate::settings::{Settings, SshdPolicy};
use crate::ssh::{
    single_quote, AuthMethod, CommandRunner, ConnectionNegotiator, Connector, Credentials,
    RemoteSession,
};

/// OS package update, run once while securing a fresh host
pub const OS_UPDATE_COMMAND: &str = "DEBIAN_FRONTEND=noninteractive apt-get -qq update \
     && DEBIAN_FRONTEND=noninteractive apt-get -qq -y upgrade";

/// States of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Start,
    KeyEnsured,
    PortSelected { port: u16 },
    Authenticated { port: u16, method: AuthMethod },
    KeyProvisioned,
    OsUpdated,
    /// Host was already hardened; no OS update this run
    OsUpdateSkipped,
    Hardened,
    Reauthenticated { port: u16, method: AuthMethod },
    FirewallReady,
    AppsInstalled,
    Done,
    Failed(String),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::PortSelected { port } => write!(f, "PortSelected({})", port),
            RunState::Authenticated { port, method } => {
                write!(f, "Authenticated(port {}, {})", port, method)
            }
            RunState::Reauthenticated { port, method } => {
                write!(f, "Reauthenticated(port {}, {})", port, method)
            }
            RunState::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Summary of a completed run
#[derive(Debug)]
pub struct RunReport {
    /// Port of the final session
    pub port: u16,
    /// Authentication method of the final session
    pub method: AuthMethod,
    /// Whether key copy and hardening ran in this run
    pub hardened: bool,
    pub states: Vec<RunState>,
    pub apps: Vec<AppOutcome>,
}

impl RunReport {
    /// Recorded best-effort failures, in the order they happened
    pub fn failures(&self) -> impl Iterator<Item = &SetupError> {
        self.apps
            .iter()
            .flat_map(|a| a.install_error.iter().chain(a.hook_error.iter()))
            .filter(|e| e.is_best_effort())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Command appending `key_line` to the admin user's `authorized_keys` once
pub fn authorized_key_command(key_line: &str) -> String {
    let key = single_quote(key_line);
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys \
         && chmod 600 ~/.ssh/authorized_keys \
         && (grep -qxF {key} ~/.ssh/authorized_keys || echo {key} >> ~/.ssh/authorized_keys)",
        key = key
    )
}

/// Whether the session still needs key copy and hardening.
///
/// With an unchanged port a key session is not proof of a hardened host;
/// the run then checks `sshd_config` itself.
pub fn needs_hardening(policy: &SshdPolicy, port: u16, method: AuthMethod) -> bool {
    if policy.port_before_setup != policy.port {
        port == policy.port_before_setup
    } else {
        method == AuthMethod::Password
    }
}

/// Drives one provisioning run
pub struct Orchestrator<'a, C: Connector> {
    settings: &'a Settings,
    connector: &'a C,
    keys: LocalKeyPair,
    template: String,
    hooks: HookRegistry,
    runner: CommandRunner,
    probe_timeout: Duration,
    instance_dir: Option<PathBuf>,
    progress: Progress,
    states: Vec<RunState>,
}

impl<'a, C: Connector> Orchestrator<'a, C> {
    pub fn new(
        settings: &'a Settings,
        connector: &'a C,
        keys: LocalKeyPair,
        runner: CommandRunner,
    ) -> Self {
        Self {
            settings,
            connector,
            keys,
            template: firewall::DEFAULT_TEMPLATE.to_string(),
            hooks: HookRegistry::with_defaults(),
            runner,
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
            instance_dir: None,
            progress: Progress::hidden(),
            states: vec![RunState::Start],
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Keep a copy of every uploaded ruleset in `dir`
    pub fn with_instance_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.instance_dir = Some(dir.into());
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Run to `Done` or the first critical failure
    pub async fn run(mut self) -> Result<RunReport> {
        match self.execute().await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.progress.failed();
                self.transition(RunState::Failed(e.to_string()));
                error!("Run failed: {}", e);
                Err(e)
            }
        }
    }

    fn transition(&mut self, state: RunState) {
        info!("State → {}", state);
        self.states.push(state);
    }

    async fn execute(&mut self) -> Result<RunReport> {
        let settings = self.settings;
        let connector = self.connector;
        let policy = &settings.sshd_config;
        let host = &settings.host;

        self.hooks.check(&settings.app_host)?;

        self.progress.start("Check for local ssh key, create one if missing");
        if self.keys.ensure()? {
            info!("Created key pair {}", self.keys.private_path().display());
        }
        self.progress.done();
        self.transition(RunState::KeyEnsured);

        let credentials = Credentials::new(host.admin_user.clone())
            .with_password(host.admin_password.clone())
            .with_private_key(self.keys.load_private_or_warn());
        let negotiator =
            ConnectionNegotiator::new(connector).with_probe_timeout(self.probe_timeout);

        self.progress.start("Connect server through ssh");
        let mut session = self
            .connect(&negotiator, &credentials, &policy.candidate_ports())
            .await?;
        self.progress.done();
        self.transition(RunState::Authenticated {
            port: session.port(),
            method: session.method(),
        });

        let mut hardened = needs_hardening(policy, session.port(), session.method());
        if !hardened && policy.port_before_setup == policy.port {
            let applied = self.policy_applied(&mut session).await;
            match applied {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "Key login works but {} does not match the policy yet, hardening again",
                        hardening::SSHD_CONFIG_PATH
                    );
                    hardened = true;
                }
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            }
        }
        if hardened {
            if credentials.private_key.is_none() {
                session.close().await;
                return Err(SetupError::ssh_key(format!(
                    "{} is not usable; refusing to disable password login",
                    self.keys.private_path().display()
                )));
            }

            let secured = self.secure_host(&mut session).await;
            session.close().await;
            secured?;

            self.progress.start("Reconnect server on the new ssh port");
            session = self
                .connect(&negotiator, &credentials, &[policy.port])
                .await?;
            self.progress.done();
            self.transition(RunState::Reauthenticated {
                port: session.port(),
                method: session.method(),
            });
        } else {
            info!(
                "Host already answers on port {}, skipping key copy, OS update and hardening",
                session.port()
            );
            self.progress.start("Host: Update and upgrade software");
            self.progress.skipped();
            self.transition(RunState::OsUpdateSkipped);
        }

        let provisioned = self.provision(&mut session).await;
        let port = session.port();
        let method = session.method();
        session.close().await;
        let apps = provisioned?;

        self.transition(RunState::Done);
        Ok(RunReport {
            port,
            method,
            hardened,
            states: std::mem::take(&mut self.states),
            apps,
        })
    }

    /// Select a port, record it, then authenticate on it
    async fn connect(
        &mut self,
        negotiator: &ConnectionNegotiator<'a, C>,
        credentials: &Credentials,
        candidates: &[u16],
    ) -> Result<C::Session> {
        let settings = self.settings;
        let host = &settings.host.ip_address;
        let port = negotiator.select_port(host, candidates).await?;
        self.transition(RunState::PortSelected { port });
        negotiator.authenticate(host, credentials, port).await
    }

    /// Whether every policy directive is already present in sshd_config
    async fn policy_applied(&mut self, session: &mut dyn RemoteSession) -> Result<bool> {
        let check = hardening::verify_command(&self.settings.sshd_config);
        Ok(self.runner.run(session, &check).await?.success())
    }

    /// Copy the key, update the OS and rewrite sshd_config
    async fn secure_host(&mut self, session: &mut dyn RemoteSession) -> Result<()> {
        self.progress.start("Copy public ssh key to server");
        let key_line = self.keys.public_key_line()?;
        self.runner
            .run_critical(session, &authorized_key_command(&key_line))
            .await?;
        self.runner
            .run_critical(session, hardening::SSHD_RESTART_COMMAND)
            .await?;
        self.progress.done();
        self.transition(RunState::KeyProvisioned);

        self.progress.start("Host: Update and upgrade software");
        self.runner.run_critical(session, OS_UPDATE_COMMAND).await?;
        self.progress.done();
        self.transition(RunState::OsUpdated);

        self.progress.start("Host: Securing ssh connection");
        let plan = hardening::generate(&self.settings.sshd_config);
        for command in plan.commands() {
            self.runner.run_critical(session, command).await?;
        }
        self.progress.done();
        self.transition(RunState::Hardened);
        Ok(())
    }

    /// Firewall and packages on the final session
    async fn provision(&mut self, session: &mut dyn RemoteSession) -> Result<Vec<AppOutcome>> {
        let settings = self.settings;
        let provisioner = FirewallProvisioner::new(self.runner);

        self.progress.start("Host: Firewall setup");
        let mut ruleset = firewall::render(&self.template, session.port());
        provisioner.apply(session, &ruleset).await?;
        self.save_ruleset(&ruleset);
        self.progress.done();
        self.transition(RunState::FirewallReady);

        let installer = AppInstaller::new(self.runner);
        let mut outcomes = Vec::with_capacity(settings.app_host.len());
        for app in &settings.app_host {
            self.progress.start(&format!("Host: Install {}", app.name));
            let outcome = installer
                .install_one(session, app, &mut ruleset, &self.hooks)
                .await?;
            match (&outcome.install_error, &outcome.hook) {
                (Some(_), _) | (None, HookOutcome::Failed(_)) => self.progress.failed(),
                _ => self.progress.done(),
            }
            outcomes.push(outcome);
        }
        if !ruleset.services().is_empty() {
            self.save_ruleset(&ruleset);
        }
        self.transition(RunState::AppsInstalled);

        Ok(outcomes)
    }

    fn save_ruleset(&self, ruleset: &FirewallRuleset) {
        let Some(dir) = self.instance_dir.as_ref() else {
            return;
        };
        let path = dir.join("nftables.conf");
        if let Err(e) = std::fs::write(&path, ruleset.text()) {
            warn!("Could not write {}: {}", path.display(), e);
        }
    }
}
