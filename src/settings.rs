//! Settings document
//!
//! The resolved policy for one run: who to connect to, how the SSH daemon
//! should end up configured, and which packages to install. Loaded once and
//! read-only afterwards.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, SetupError};

/// Template written when no settings document exists yet
pub const SETTINGS_TEMPLATE: &str = include_str!("../assets/settings.json");

/// Directive name carrying the post-hardening port
pub const PORT_DIRECTIVE: &str = "Port";

/// Key carrying the pre-hardening port; never rewritten on the host
pub const PORT_BEFORE_SETUP_KEY: &str = "port_before_setup";

/// Settings document root
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: HostTarget,
    pub sshd_config: SshdPolicy,
    #[serde(default)]
    pub app_host: Vec<AppSpec>,
}

/// Connection identity of the target host
#[derive(Clone, Deserialize)]
pub struct HostTarget {
    pub ip_address: String,
    pub admin_user: String,
    #[serde(default)]
    pub admin_password: Option<String>,
}

impl std::fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTarget")
            .field("ip_address", &self.ip_address)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Desired SSH daemon policy
///
/// `directives` keeps the document order and contains `Port` exactly once.
/// The pre-setup port lives in its own field and is never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct SshdPolicy {
    pub port_before_setup: u16,
    pub port: u16,
    pub directives: Vec<(String, String)>,
}

/// A package to install, with an optional post-install hook
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppSpec {
    pub name: String,
    #[serde(default)]
    pub hook: Option<String>,
}

impl AppSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    /// Hook name to look up: the declared one, else `<name>_setup`
    pub fn hook_name(&self) -> String {
        self.hook
            .clone()
            .unwrap_or_else(|| format!("{}_setup", self.name))
    }
}

/// Outcome of looking for the settings document
#[derive(Debug)]
pub enum SettingsLoad {
    Loaded(Settings),
    /// No document existed; a template was written to this path
    TemplateWritten(PathBuf),
}

impl SshdPolicy {
    /// Candidate ports for the first negotiation: legacy port first
    pub fn candidate_ports(&self) -> Vec<u16> {
        vec![self.port_before_setup, self.port]
    }
}

impl TryFrom<Map<String, Value>> for SshdPolicy {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        let mut port_before_setup = 22;
        let mut port = None;
        let mut directives = Vec::with_capacity(map.len());

        for (key, value) in map {
            if key == PORT_BEFORE_SETUP_KEY {
                port_before_setup = parse_port(&key, &value)?;
                continue;
            }

            validate_directive_name(&key)?;
            if key == PORT_DIRECTIVE {
                port = Some(parse_port(&key, &value)?);
            }
            let rendered = directive_value(&key, &value)?;
            directives.push((key, rendered));
        }

        let port = port.ok_or_else(|| "sshd_config must declare `Port`".to_string())?;

        Ok(SshdPolicy {
            port_before_setup,
            port,
            directives,
        })
    }
}

fn parse_port(key: &str, value: &Value) -> std::result::Result<u16, String> {
    let n = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if (1..=u64::from(u16::MAX)).contains(&n) => Ok(n as u16),
        _ => Err(format!("`{}` must be a port number (1-65535), got {}", key, value)),
    }
}

fn validate_directive_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("invalid sshd directive name `{}`", name));
    }
    Ok(())
}

/// Render a directive value as it will appear in sshd_config
fn directive_value(key: &str, value: &Value) -> std::result::Result<String, String> {
    let rendered = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        _ => return Err(format!("sshd directive `{}` has unsupported value {}", key, value)),
    };

    if rendered.is_empty() {
        return Err(format!("sshd directive `{}` has an empty value", key));
    }

    // Values end up inside a single-quoted sed expression delimited by `|`
    if let Some(bad) = rendered
        .chars()
        .find(|c| matches!(c, '\'' | '|' | '\\' | '&' | '\n' | '\r'))
    {
        return Err(format!(
            "sshd directive `{}` contains unsupported character {:?}",
            key, bad
        ));
    }

    Ok(rendered)
}

/// Debian package names: lowercase alphanumerics plus `.+-`, optional `=version`
fn validate_package_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || ".+-=:~".contains(c));
    if !valid {
        return Err(SetupError::config(format!(
            "invalid package name `{}` in app_host",
            name
        )));
    }
    Ok(())
}

impl Settings {
    /// Parse and validate a settings document
    pub fn from_json(data: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and validate the settings document at `path`
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Load the settings document, or write the template if it does not exist
    pub fn load_or_write_template(path: &Path) -> Result<SettingsLoad> {
        if path.is_file() {
            return Self::load(path).map(SettingsLoad::Loaded);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, SETTINGS_TEMPLATE)?;
        info!("Settings template written to {}", path.display());
        Ok(SettingsLoad::TemplateWritten(path.to_path_buf()))
    }

    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.host.ip_address.trim().is_empty() {
            errors.push("host.ip_address is empty".to_string());
        }
        if self.host.admin_user.trim().is_empty() {
            errors.push("host.admin_user is empty".to_string());
        }
        for app in &self.app_host {
            if let Err(e) = validate_package_name(&app.name) {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            return Err(SetupError::Config(format!(
                "Invalid settings:\n{}",
                errors.join("\n")
            )));
        }
        Ok(())
    }
}
