//! In-memory SSH host shared by the integration tests.
//!
//! `FakeHost` models just enough of a Debian box for a run: which ports
//! accept TCP, whether the local key is authorized, whether password login
//! is still enabled, and what `sshd_config` will switch to on the next
//! `systemctl restart ssh`.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use server_setup::error::{Result, SetupError};
use server_setup::keys::LocalKeyPair;
use server_setup::settings::Settings;
use server_setup::ssh::{AuthMethod, CommandOutput, Connector, Credentials, RemoteSession};

pub const HOST: &str = "192.0.2.10";
pub const PASSWORD: &str = "changeme";

/// Settings document for a fresh host: password on 22, hardened port 10322
pub fn settings_json(port_before_setup: u16, port: u16, apps: &str) -> String {
    format!(
        r#"{{
            "host": {{ "ip_address": "{HOST}", "admin_user": "root", "admin_password": "{PASSWORD}" }},
            "sshd_config": {{
                "port_before_setup": {port_before_setup},
                "Port": {port},
                "PermitRootLogin": "prohibit-password",
                "PasswordAuthentication": "no",
                "UsePAM": "no"
            }},
            "app_host": {apps}
        }}"#
    )
}

pub fn settings(port_before_setup: u16, port: u16, apps: &str) -> Settings {
    Settings::from_json(&settings_json(port_before_setup, port, apps)).expect("valid settings")
}

/// A freshly generated key pair in its own temp dir
pub fn key_pair() -> (tempfile::TempDir, LocalKeyPair) {
    let dir = tempfile::tempdir().expect("tempdir");
    let keys = LocalKeyPair::new(dir.path().join("id_ed25519"));
    keys.ensure().expect("key generation");
    (dir, keys)
}

#[derive(Debug, Default)]
struct HostState {
    open_ports: Vec<u16>,
    password: Option<String>,
    password_login: bool,
    key_authorized: bool,
    pending_port: Option<u16>,
    pending_password_off: bool,
    failing: Vec<String>,
    commands: Vec<String>,
    uploads: Vec<(String, String)>,
    auth_attempts: Vec<(u16, AuthMethod)>,
    closed: usize,
    restart_ignored: bool,
    events: Vec<String>,
}

/// Shared, inspectable fake host
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    /// Stock Debian install: SSH on 22, root password login
    pub fn fresh() -> Self {
        Self::with_ports(&[22])
    }

    pub fn with_ports(ports: &[u16]) -> Self {
        let state = HostState {
            open_ports: ports.to_vec(),
            password: Some(PASSWORD.to_string()),
            password_login: true,
            ..HostState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Host already hardened on `port`: key only
    pub fn hardened(port: u16) -> Self {
        let host = Self::with_ports(&[port]);
        {
            let mut state = host.lock();
            state.key_authorized = true;
            state.password_login = false;
        }
        host
    }

    /// Commands containing `needle` exit 100
    pub fn fail_commands_containing(&self, needle: &str) {
        self.lock().failing.push(needle.to_string());
    }

    pub fn authorize_key(&self) {
        self.lock().key_authorized = true;
    }

    /// `systemctl restart ssh` exits 0 but sshd keeps its old config
    pub fn ignore_sshd_restart(&self) {
        self.lock().restart_ignored = true;
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector { host: self.clone() }
    }

    /// Session opened without going through authentication
    pub fn session(&self, port: u16, method: AuthMethod) -> FakeSession {
        FakeSession {
            host: self.clone(),
            port,
            method,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.lock().uploads.clone()
    }

    pub fn auth_attempts(&self) -> Vec<(u16, AuthMethod)> {
        self.lock().auth_attempts.clone()
    }

    pub fn open_ports(&self) -> Vec<u16> {
        self.lock().open_ports.clone()
    }

    pub fn password_login(&self) -> bool {
        self.lock().password_login
    }

    pub fn key_authorized(&self) -> bool {
        self.lock().key_authorized
    }

    pub fn closed_sessions(&self) -> usize {
        self.lock().closed
    }

    /// Connection events in order: `tcp:<port>`, `auth:<port>:<method>`, `close:<port>`
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().expect("fake host mutex poisoned")
    }

    fn exec(&self, command: &str) -> CommandOutput {
        let mut state = self.lock();
        state.commands.push(command.to_string());

        if state.failing.iter().any(|needle| command.contains(needle)) {
            return CommandOutput {
                stderr: format!("E: simulated failure of `{}`", command),
                ..CommandOutput::with_exit_code(100)
            };
        }

        if command.contains(">> ~/.ssh/authorized_keys") {
            state.key_authorized = true;
        }
        if command.starts_with("sed -i") {
            if let Some(port) = sed_port(command) {
                state.pending_port = Some(port);
            }
            if command.contains("|PasswordAuthentication no|") {
                state.pending_password_off = true;
            }
        }
        if command.starts_with("grep -qx ") {
            // sshd_config matches the policy once password login is off
            let code = if state.password_login { 1 } else { 0 };
            return CommandOutput::with_exit_code(code);
        }
        if command == "systemctl restart ssh" && !state.restart_ignored {
            if let Some(port) = state.pending_port.take() {
                state.open_ports = vec![port];
            }
            if std::mem::take(&mut state.pending_password_off) {
                state.password_login = false;
            }
        }

        CommandOutput::with_exit_code(0)
    }
}

/// Port from the `Port` rewrite, e.g. `...|Port 10322|'`
fn sed_port(command: &str) -> Option<u16> {
    let rest = command.split("|Port ").nth(1)?;
    rest.split('|').next()?.trim().parse().ok()
}

/// Connector backed by a [`FakeHost`]
#[derive(Debug, Clone)]
pub struct FakeConnector {
    host: FakeHost,
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn probe(&self, _host: &str, port: u16, _timeout: Duration) -> bool {
        let mut state = self.host.lock();
        state.events.push(format!("tcp:{}", port));
        state.open_ports.contains(&port)
    }

    async fn authenticate(
        &self,
        _host: &str,
        port: u16,
        credentials: &Credentials,
        method: AuthMethod,
    ) -> Result<FakeSession> {
        let mut state = self.host.lock();
        state.auth_attempts.push((port, method));
        state.events.push(format!("auth:{}:{}", port, method));

        if !state.open_ports.contains(&port) {
            return Err(SetupError::connection(format!("connection refused on {}", port)));
        }

        let accepted = match method {
            AuthMethod::Key => credentials.private_key.is_some() && state.key_authorized,
            AuthMethod::Password => {
                state.password_login
                    && credentials.password.is_some()
                    && credentials.password == state.password
            }
        };
        if !accepted {
            return Err(SetupError::auth(format!("{} rejected", method)));
        }

        drop(state);
        Ok(self.host.session(port, method))
    }
}

/// Session on a [`FakeHost`]
#[derive(Debug)]
pub struct FakeSession {
    host: FakeHost,
    port: u16,
    method: AuthMethod,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn port(&self) -> u16 {
        self.port
    }

    fn method(&self) -> AuthMethod {
        self.method
    }

    async fn exec(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        Ok(self.host.exec(command))
    }

    async fn upload(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        self.host.lock().uploads.push((
            remote_path.to_string(),
            String::from_utf8_lossy(contents).into_owned(),
        ));
        Ok(())
    }

    async fn close(self) {
        let mut state = self.host.lock();
        state.closed += 1;
        state.events.push(format!("close:{}", self.port));
    }
}
