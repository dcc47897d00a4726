//! Port and authentication negotiation

use std::time::Duration;

use tracing::{debug, info, warn};

use super::session::{AuthMethod, Connector, Credentials};
use crate::config::PROBE_TIMEOUT_SECS;
use crate::error::{Result, SetupError};

/// Selects a reachable port and a working authentication method
///
/// Ports are tried in the caller's order, so the same logic serves a fresh
/// host (legacy port first) and an already hardened one (hardened port as
/// fallback).
#[derive(Debug)]
pub struct ConnectionNegotiator<'a, C> {
    connector: &'a C,
    probe_timeout: Duration,
}

impl<'a, C: Connector> ConnectionNegotiator<'a, C> {
    pub fn new(connector: &'a C) -> Self {
        Self {
            connector,
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// First candidate port accepting a TCP connection
    pub async fn select_port(&self, host: &str, candidates: &[u16]) -> Result<u16> {
        let mut tried = Vec::with_capacity(candidates.len());
        for &port in candidates {
            if tried.contains(&port) {
                continue;
            }
            tried.push(port);

            debug!("Probing {}:{}", host, port);
            if self.connector.probe(host, port, self.probe_timeout).await {
                info!("Port {} on {} is reachable", port, host);
                return Ok(port);
            }
        }

        Err(SetupError::Connectivity {
            host: host.to_string(),
            ports: tried,
        })
    }

    /// Select a port, then authenticate with the key, falling back to the password
    pub async fn negotiate(
        &self,
        host: &str,
        credentials: &Credentials,
        candidates: &[u16],
    ) -> Result<C::Session> {
        let port = self.select_port(host, candidates).await?;
        self.authenticate(host, credentials, port).await
    }

    /// Authenticate on an already selected port: key first, then password
    pub async fn authenticate(
        &self,
        host: &str,
        credentials: &Credentials,
        port: u16,
    ) -> Result<C::Session> {
        let key_failure = if credentials.private_key.is_some() {
            match self
                .connector
                .authenticate(host, port, credentials, AuthMethod::Key)
                .await
            {
                Ok(session) => return Ok(session),
                Err(SetupError::Authentication(reason)) => {
                    debug!("Key authentication failed on port {}: {}", port, reason);
                    reason
                }
                Err(e) => return Err(e),
            }
        } else {
            "no usable private key".to_string()
        };

        if credentials.password.is_none() {
            warn!("Key authentication failed and no admin password is configured");
            return Err(SetupError::auth(format!(
                "{}; no admin password configured",
                key_failure
            )));
        }

        match self
            .connector
            .authenticate(host, port, credentials, AuthMethod::Password)
            .await
        {
            Ok(session) => Ok(session),
            Err(SetupError::Authentication(reason)) => Err(SetupError::auth(format!(
                "{}; {}",
                key_failure, reason
            ))),
            Err(e) => Err(e),
        }
    }
}
