//! nftables provisioning
//!
//! The template carries `%SSH_PORT%` and `##WEBHOST##` placeholders. Rendering
//! fills in the port; services that need inbound rules register a block that
//! replaces the marker line. All registered blocks are written in one pass
//! over the rendered text, so every service sees the marker.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Result, SetupError};
use crate::ssh::{CommandRunner, RemoteSession};

/// Built-in ruleset template
pub const DEFAULT_TEMPLATE: &str = include_str!("../assets/nftables.conf");

/// Port placeholder
pub const SSH_PORT_TOKEN: &str = "%SSH_PORT%";

/// Marker where service rule blocks are injected
pub const WEBHOST_MARKER: &str = "##WEBHOST##";

/// Ruleset path on the target host
pub const REMOTE_RULESET_PATH: &str = "/etc/nftables.conf";

const LOAD_COMMAND: &str = "/usr/sbin/nft -f /etc/nftables.conf";
const ENABLE_COMMAND: &str = "systemctl enable nftables";
const START_COMMAND: &str = "systemctl start nftables";

/// Inbound rules a service asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRules {
    pub service: String,
    pub rules: Vec<String>,
}

impl ServiceRules {
    pub fn new(service: impl Into<String>, rules: Vec<String>) -> Self {
        Self {
            service: service.into(),
            rules,
        }
    }

    /// HTTP and HTTPS accept rules for a web server
    pub fn web(service: impl Into<String>) -> Self {
        Self::new(
            service,
            vec![
                r#"tcp dport 80 accept comment "accept http""#.to_string(),
                r#"tcp dport 443 accept comment "accept https""#.to_string(),
            ],
        )
    }
}

/// A rendered ruleset plus the service blocks requested so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRuleset {
    rendered: String,
    services: Vec<ServiceRules>,
}

/// Fill `%SSH_PORT%` with `port`; markers are left in place
pub fn render(template: &str, port: u16) -> FirewallRuleset {
    FirewallRuleset {
        rendered: template.replace(SSH_PORT_TOKEN, &port.to_string()),
        services: Vec::new(),
    }
}

/// Read a template override, or fall back to the built-in one
pub fn load_template(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        return Ok(DEFAULT_TEMPLATE.to_string());
    };
    let template = std::fs::read_to_string(path)?;
    if !template.contains(WEBHOST_MARKER) {
        warn!(
            "Firewall template {} has no {} marker, hooks cannot open service ports",
            path.display(),
            WEBHOST_MARKER
        );
    }
    if !template.contains(SSH_PORT_TOKEN) {
        return Err(SetupError::config(format!(
            "firewall template {} has no {} placeholder; SSH would be locked out",
            path.display(),
            SSH_PORT_TOKEN
        )));
    }
    Ok(template)
}

impl FirewallRuleset {
    /// Request `rules` at the service marker. A service registered twice
    /// keeps its first position with the new rules.
    ///
    /// Fails when the template has no marker line, since the rules would
    /// never reach the uploaded ruleset.
    pub fn inject(&mut self, rules: ServiceRules) -> Result<()> {
        if !self.rendered.contains(WEBHOST_MARKER) {
            return Err(SetupError::config(format!(
                "firewall template has no {} marker for the {} rules",
                WEBHOST_MARKER, rules.service
            )));
        }
        match self.services.iter_mut().find(|s| s.service == rules.service) {
            Some(existing) => *existing = rules,
            None => self.services.push(rules),
        }
        Ok(())
    }

    /// Services that requested rules, in request order
    pub fn services(&self) -> &[ServiceRules] {
        &self.services
    }

    /// The ruleset text to upload.
    ///
    /// Without injected services the rendered text is returned as is.
    /// Otherwise every marker line is replaced, keeping its indentation, by
    /// all requested rules in request order.
    pub fn text(&self) -> String {
        if self.services.is_empty() {
            return self.rendered.clone();
        }

        let mut out = String::with_capacity(self.rendered.len() + 128);
        for line in self.rendered.split_inclusive('\n') {
            let Some(at) = line.find(WEBHOST_MARKER) else {
                out.push_str(line);
                continue;
            };

            let indent: String = line[..at]
                .chars()
                .take_while(|c| c.is_whitespace())
                .collect();
            let prefix = &line[..at];
            let suffix = line[at + WEBHOST_MARKER.len()..].trim_end_matches(['\r', '\n']);
            let newline = &line[line.trim_end_matches(['\r', '\n']).len()..];

            let mut block: Vec<String> = self
                .services
                .iter()
                .flat_map(|s| s.rules.iter())
                .enumerate()
                .map(|(i, rule)| {
                    let lead = if i == 0 { prefix } else { indent.as_str() };
                    format!("{}{}", lead, rule)
                })
                .collect();
            if !suffix.trim().is_empty() {
                block.push(format!("{}{}", indent, suffix.trim_start()));
            }
            out.push_str(&block.join("\n"));
            out.push_str(newline);
        }
        out
    }
}

/// Uploads and activates rulesets
#[derive(Debug, Clone, Copy)]
pub struct FirewallProvisioner {
    runner: CommandRunner,
}

impl FirewallProvisioner {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    /// Upload the ruleset, load it, enable and start nftables. All critical.
    pub async fn apply(
        &self,
        session: &mut dyn RemoteSession,
        ruleset: &FirewallRuleset,
    ) -> Result<()> {
        self.upload(session, ruleset).await?;
        for command in [LOAD_COMMAND, ENABLE_COMMAND, START_COMMAND] {
            self.runner.run_critical(session, command).await?;
        }
        info!("Firewall active on port {}", session.port());
        Ok(())
    }

    /// Upload the ruleset and load it into the running nftables
    pub async fn reload(
        &self,
        session: &mut dyn RemoteSession,
        ruleset: &FirewallRuleset,
    ) -> Result<()> {
        self.upload(session, ruleset).await?;
        self.runner.run_critical(session, LOAD_COMMAND).await?;
        Ok(())
    }

    async fn upload(&self, session: &mut dyn RemoteSession, ruleset: &FirewallRuleset) -> Result<()> {
        let text = ruleset.text();
        debug!("Uploading ruleset ({} bytes)", text.len());
        session
            .upload(REMOTE_RULESET_PATH, text.as_bytes(), self.runner.timeout())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "table inet filter {\n    chain input {\n        tcp dport %SSH_PORT% accept\n        ##WEBHOST##\n    }\n}\n# ssh on %SSH_PORT%\n";

    #[test]
    fn test_render_replaces_every_port_token() {
        let ruleset = render(TEMPLATE, 10322);
        let text = ruleset.text();
        assert!(!text.contains(SSH_PORT_TOKEN));
        assert_eq!(text.matches("10322").count(), 2);
    }

    #[test]
    fn test_render_leaves_marker_without_services() {
        let text = render(TEMPLATE, 10322).text();
        assert_eq!(text.matches(WEBHOST_MARKER).count(), 1);
    }

    #[test]
    fn test_web_injection_consumes_marker() {
        let mut ruleset = render(TEMPLATE, 10322);
        ruleset.inject(ServiceRules::web("nginx")).unwrap();
        let text = ruleset.text();

        assert!(!text.contains(WEBHOST_MARKER));
        assert!(text.contains("        tcp dport 80 accept comment \"accept http\"\n"));
        assert!(text.contains("        tcp dport 443 accept comment \"accept https\"\n"));
        assert!(text.contains("tcp dport 10322 accept"));
    }

    #[test]
    fn test_multiple_services_share_one_marker() {
        let mut ruleset = render(TEMPLATE, 2222);
        ruleset.inject(ServiceRules::web("nginx")).unwrap();
        ruleset
            .inject(ServiceRules::new(
                "postgresql",
                vec!["tcp dport 5432 accept".to_string()],
            ))
            .unwrap();
        let text = ruleset.text();

        let http = text.find("dport 80 ").unwrap();
        let pg = text.find("dport 5432").unwrap();
        assert!(http < pg);
        assert!(!text.contains(WEBHOST_MARKER));
        assert_eq!(ruleset.services().len(), 2);
    }

    #[test]
    fn test_reinjecting_service_does_not_duplicate() {
        let mut ruleset = render(TEMPLATE, 2222);
        ruleset.inject(ServiceRules::web("nginx")).unwrap();
        ruleset.inject(ServiceRules::web("nginx")).unwrap();
        assert_eq!(ruleset.text().matches("dport 443").count(), 1);
    }

    #[test]
    fn test_every_marker_line_receives_rules() {
        let template = "##WEBHOST##\nmiddle\n  ##WEBHOST##";
        let mut ruleset = render(template, 22);
        ruleset
            .inject(ServiceRules::new("svc", vec!["tcp dport 8080 accept".to_string()]))
            .unwrap();
        assert_eq!(
            ruleset.text(),
            "tcp dport 8080 accept\nmiddle\n  tcp dport 8080 accept"
        );
    }

    #[test]
    fn test_injection_without_marker_fails() {
        let template = "table inet filter {\n  tcp dport %SSH_PORT% accept\n}\n";
        let mut ruleset = render(template, 22);
        let err = ruleset.inject(ServiceRules::web("nginx")).unwrap_err();
        assert!(matches!(err, SetupError::Config(_)), "{err}");
        assert!(err.to_string().contains(WEBHOST_MARKER));
        assert!(ruleset.services().is_empty());
        assert!(!ruleset.text().contains("dport 80"));
    }

    #[test]
    fn test_default_template_has_placeholders() {
        assert!(DEFAULT_TEMPLATE.contains(SSH_PORT_TOKEN));
        assert!(DEFAULT_TEMPLATE.contains(WEBHOST_MARKER));
        assert_eq!(load_template(None).unwrap(), DEFAULT_TEMPLATE);
    }

    #[test]
    fn test_template_without_port_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nftables.conf");
        std::fs::write(&path, "table inet filter {}\n").unwrap();
        assert!(load_template(Some(&path)).is_err());
    }
}
