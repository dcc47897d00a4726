//! Package installation and post-install hooks
//!
//! Packages are installed one by one; a failed install is recorded and the
//! next package is attempted. After a successful install the hook named by
//! the [`AppSpec`] is looked up in the [`HookRegistry`] and run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Result, SetupError};
use crate::firewall::{FirewallProvisioner, FirewallRuleset, ServiceRules};
use crate::settings::AppSpec;
use crate::ssh::{CommandRunner, Criticality, RemoteSession};

/// Everything a hook may touch
pub struct HookContext<'a> {
    pub session: &'a mut dyn RemoteSession,
    pub firewall: &'a mut FirewallRuleset,
    pub runner: &'a CommandRunner,
    pub provisioner: &'a FirewallProvisioner,
}

/// Follow-up work after a package is installed
#[async_trait]
pub trait PostInstallHook: Send + Sync {
    /// Name an [`AppSpec`] refers to
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut HookContext<'_>) -> Result<()>;
}

/// Starts nginx and opens HTTP/HTTPS in the firewall
#[derive(Debug, Default)]
pub struct NginxHook;

#[async_trait]
impl PostInstallHook for NginxHook {
    fn name(&self) -> &str {
        "nginx_setup"
    }

    async fn run(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        for command in ["systemctl start nginx", "systemctl enable nginx"] {
            ctx.runner.run_critical(ctx.session, command).await?;
        }

        ctx.firewall.inject(ServiceRules::web("nginx"))?;
        ctx.provisioner.reload(ctx.session, ctx.firewall).await
    }
}

/// Hooks by name
pub struct HookRegistry {
    hooks: BTreeMap<String, Box<dyn PostInstallHook>>,
}

impl HookRegistry {
    /// Registry without hooks
    pub fn empty() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }

    /// Registry with the built-in hooks
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(NginxHook);
        registry
    }

    pub fn register(&mut self, hook: impl PostInstallHook + 'static) {
        self.hooks.insert(hook.name().to_string(), Box::new(hook));
    }

    pub fn get(&self, name: &str) -> Option<&dyn PostInstallHook> {
        self.hooks.get(name).map(|h| h.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }

    /// Fail when an app explicitly names a hook that is not registered
    pub fn check(&self, apps: &[AppSpec]) -> Result<()> {
        let missing: Vec<String> = apps
            .iter()
            .filter_map(|app| {
                app.hook
                    .as_deref()
                    .filter(|hook| !self.hooks.contains_key(*hook))
                    .map(|hook| format!("`{}` (for package `{}`)", hook, app.name))
            })
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        Err(SetupError::config(format!(
            "unknown post-install hook {}; available: {}",
            missing.join(", "),
            self.names().collect::<Vec<_>>().join(", ")
        )))
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.hooks.keys()).finish()
    }
}

/// What happened to a package's hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// No hook registered under the package's hook name
    None,
    /// Install failed, hook not attempted
    Skipped,
    Ran(String),
    Failed(String),
}

/// Result for one [`AppSpec`]
#[derive(Debug)]
pub struct AppOutcome {
    pub name: String,
    pub install_error: Option<SetupError>,
    pub hook: HookOutcome,
    pub hook_error: Option<SetupError>,
}

impl AppOutcome {
    pub fn installed(&self) -> bool {
        self.install_error.is_none()
    }
}

/// Installs packages with `apt-get`
#[derive(Debug, Clone, Copy)]
pub struct AppInstaller {
    runner: CommandRunner,
    provisioner: FirewallProvisioner,
}

impl AppInstaller {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            provisioner: FirewallProvisioner::new(runner),
        }
    }

    /// Install command for a package
    pub fn install_command(package: &str) -> String {
        format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -qq -y {}",
            package
        )
    }

    /// Install `apps` in order and dispatch their hooks.
    ///
    /// Only transport errors are returned; install and hook failures are
    /// recorded in the outcomes.
    pub async fn install_all(
        &self,
        session: &mut dyn RemoteSession,
        apps: &[AppSpec],
        firewall: &mut FirewallRuleset,
        registry: &HookRegistry,
    ) -> Result<Vec<AppOutcome>> {
        let mut outcomes = Vec::with_capacity(apps.len());
        for app in apps {
            outcomes.push(self.install_one(session, app, firewall, registry).await?);
        }
        Ok(outcomes)
    }

    /// Install a single package and run its hook
    pub async fn install_one(
        &self,
        session: &mut dyn RemoteSession,
        app: &AppSpec,
        firewall: &mut FirewallRuleset,
        registry: &HookRegistry,
    ) -> Result<AppOutcome> {
        info!("Installing {}", app.name);
        let output = self
            .runner
            .run_with(
                session,
                &Self::install_command(&app.name),
                Criticality::BestEffort,
            )
            .await?;

        if !output.success() {
            let err = SetupError::PackageInstall {
                package: app.name.clone(),
                exit_code: output.exit_code.unwrap_or_default(),
                stderr: output.failure_detail(),
            };
            warn!("{}", err);
            return Ok(AppOutcome {
                name: app.name.clone(),
                install_error: Some(err),
                hook: HookOutcome::Skipped,
                hook_error: None,
            });
        }

        let hook_name = app.hook_name();
        let Some(hook) = registry.get(&hook_name) else {
            return Ok(AppOutcome {
                name: app.name.clone(),
                install_error: None,
                hook: HookOutcome::None,
                hook_error: None,
            });
        };

        info!("Running {} for {}", hook_name, app.name);
        let mut ctx = HookContext {
            session,
            firewall,
            runner: &self.runner,
            provisioner: &self.provisioner,
        };
        let (hook_outcome, hook_error) = match hook.run(&mut ctx).await {
            Ok(()) => (HookOutcome::Ran(hook_name), None),
            Err(e) => {
                let err = SetupError::HookDispatch {
                    hook: hook_name.clone(),
                    package: app.name.clone(),
                    reason: e.to_string(),
                };
                warn!("{}", err);
                (HookOutcome::Failed(hook_name), Some(err))
            }
        };

        Ok(AppOutcome {
            name: app.name.clone(),
            install_error: None,
            hook: hook_outcome,
            hook_error,
        })
    }
}
