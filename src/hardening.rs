//! SSH daemon hardening commands
//!
//! Turns an [`SshdPolicy`] into in-place rewrites of `/etc/ssh/sshd_config`
//! followed by a single daemon restart.

use crate::settings::SshdPolicy;
use crate::ssh::single_quote;

/// SSH daemon configuration file on the target host
pub const SSHD_CONFIG_PATH: &str = "/etc/ssh/sshd_config";

/// Restart command activating a rewritten sshd_config (Debian unit name)
pub const SSHD_RESTART_COMMAND: &str = "systemctl restart ssh";

/// Ordered rewrites plus the restart that activates them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardeningPlan {
    pub substitutions: Vec<String>,
    pub restart: String,
}

impl HardeningPlan {
    /// All commands in execution order, restart last
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.substitutions
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.restart.as_str()))
    }
}

/// Build the hardening plan for `policy`
pub fn generate(policy: &SshdPolicy) -> HardeningPlan {
    HardeningPlan {
        substitutions: policy
            .directives
            .iter()
            .map(|(name, value)| substitution(name, value, SSHD_CONFIG_PATH))
            .collect(),
        restart: SSHD_RESTART_COMMAND.to_string(),
    }
}

/// Command exiting 0 only when every directive line of `policy` is
/// present verbatim in sshd_config
pub fn verify_command(policy: &SshdPolicy) -> String {
    let file = single_quote(SSHD_CONFIG_PATH);
    policy
        .directives
        .iter()
        .map(|(name, value)| {
            format!(
                "grep -qx {} {}",
                single_quote(&format!("{} {}", name, value)),
                file
            )
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Rewrite `name` to `name value` in `path`, appending it when no line matched.
///
/// Matches the directive at line start, optionally commented out, so
/// `Port` does not touch `GatewayPorts`. Running it twice is a no-op.
pub fn substitution(name: &str, value: &str, path: &str) -> String {
    let file = single_quote(path);
    let expr = format!(
        "s|^#\\?[[:space:]]*{name}\\([[:space:]].*\\)\\?$|{name} {value}|",
        name = name,
        value = value
    );
    let line = format!("{} {}", name, value);
    format!(
        "sed -i {expr} {file} && (grep -q {present} {file} || echo {line} >> {file})",
        expr = single_quote(&expr),
        file = file,
        present = single_quote(&format!("^{}[[:space:]]", name)),
        line = single_quote(&line),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SshdPolicy {
        SshdPolicy {
            port_before_setup: 22,
            port: 10322,
            directives: vec![
                ("Port".to_string(), "10322".to_string()),
                ("PermitRootLogin".to_string(), "prohibit-password".to_string()),
                ("PasswordAuthentication".to_string(), "no".to_string()),
                ("UsePAM".to_string(), "no".to_string()),
            ],
        }
    }

    #[test]
    fn test_one_substitution_per_directive() {
        let plan = generate(&policy());
        assert_eq!(plan.substitutions.len(), 4);
        for ((name, value), cmd) in policy().directives.iter().zip(&plan.substitutions) {
            assert!(cmd.contains(name.as_str()), "{cmd}");
            assert!(cmd.contains(&format!("{} {}", name, value)), "{cmd}");
            assert!(!cmd.contains("systemctl"), "{cmd}");
        }
    }

    #[test]
    fn test_pre_setup_port_never_rewritten() {
        let plan = generate(&policy());
        assert!(plan.commands().all(|c| !c.contains("port_before_setup")));
    }

    #[test]
    fn test_restart_appended_once_at_end() {
        let plan = generate(&policy());
        let commands: Vec<&str> = plan.commands().collect();
        assert_eq!(commands.len(), 5);
        assert_eq!(commands.last().copied(), Some(SSHD_RESTART_COMMAND));
        assert_eq!(
            commands
                .iter()
                .filter(|c| c.contains("systemctl restart"))
                .count(),
            1
        );
    }

    #[test]
    fn test_insertion_order_preserved() {
        let plan = generate(&policy());
        assert!(plan.substitutions[0].contains("Port 10322"));
        assert!(plan.substitutions[3].contains("UsePAM no"));
    }

    #[test]
    fn test_verify_command_checks_every_directive() {
        let cmd = verify_command(&policy());
        assert_eq!(cmd.matches("grep -qx ").count(), 4);
        assert!(cmd.starts_with("grep -qx 'Port 10322' '/etc/ssh/sshd_config' && "));
        assert!(cmd.ends_with("grep -qx 'UsePAM no' '/etc/ssh/sshd_config'"));
        assert!(!cmd.contains("port_before_setup"));
    }

    #[test]
    fn test_substitution_shape() {
        let cmd = substitution("Port", "10322", SSHD_CONFIG_PATH);
        assert_eq!(
            cmd,
            "sed -i 's|^#\\?[[:space:]]*Port\\([[:space:]].*\\)\\?$|Port 10322|' '/etc/ssh/sshd_config' \
             && (grep -q '^Port[[:space:]]' '/etc/ssh/sshd_config' \
             || echo 'Port 10322' >> '/etc/ssh/sshd_config')"
        );
    }
}
