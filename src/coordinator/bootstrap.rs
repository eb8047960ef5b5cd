//! Discovery bootstrap
//!
//! Decides whether this host should launch the discovery registrar. This is a
//! probe-then-start heuristic, not a lock: two hosts racing through it may
//! both start a registrar, and the fleet tolerates the extra one.

use crate::common::{DiscoveryConfig, Error};
use crate::coordination::RegistrarProbe;
use crate::process::{CommandSpec, ProcessSupervisor, ServiceRegistry, SupervisorOptions};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the registrar may run. Empty `allowed_hosts` allows every host;
/// empty `locators` means multicast discovery, where any host is eligible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryConstraints {
    pub allowed_hosts: Vec<String>,
    pub locators: Vec<String>,
}

impl DiscoveryConstraints {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            locators: config.locators.clone(),
        }
    }

    pub fn is_unicast(&self) -> bool {
        !self.locators.is_empty()
    }
}

/// How this host is known on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

impl HostIdentity {
    pub fn new(hostname: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            hostname: hostname.into(),
            addresses,
        }
    }

    /// Resolve `hostname` to its addresses. Resolution failures leave the
    /// address list empty.
    pub fn resolve(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let addresses = match (hostname.as_str(), 0).to_socket_addrs() {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                tracing::debug!("Cannot resolve {}: {}", hostname, e);
                Vec::new()
            }
        };
        Self {
            hostname,
            addresses,
        }
    }

    fn allowed_by(&self, hosts: &[String]) -> bool {
        hosts.is_empty()
            || hosts.iter().any(|h| {
                h.eq_ignore_ascii_case(&self.hostname)
                    || h.parse::<IpAddr>()
                        .is_ok_and(|ip| self.addresses.contains(&ip))
            })
    }

    /// True if one of `locators` (`host[:port]`) names this host. Names
    /// are not resolved once `deadline` has passed. Blocks on DNS.
    fn matches_locator(&self, locators: &[String], deadline: Instant) -> bool {
        locators.iter().any(|locator| {
            let host = locator_host(locator);
            if host.eq_ignore_ascii_case(&self.hostname) {
                return true;
            }
            if let Ok(ip) = host.parse::<IpAddr>() {
                return self.addresses.contains(&ip);
            }
            if Instant::now() >= deadline {
                tracing::debug!("Not resolving locator {}: deadline passed", locator);
                return false;
            }
            match (host, 0).to_socket_addrs() {
                Ok(mut addrs) => addrs.any(|a| self.addresses.contains(&a.ip())),
                Err(_) => false,
            }
        })
    }
}

fn locator_host(locator: &str) -> &str {
    let locator = locator.trim();
    // [v6]:port
    if let Some(rest) = locator.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match locator.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => locator,
    }
}

#[derive(Debug)]
pub enum NotStarted {
    HostNotAllowed,
    NotALocator,
    EnoughRegistrars { found: usize },
    ProbeFailed(Error),
    LaunchFailed(Error),
}

impl std::fmt::Display for NotStarted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotStarted::HostNotAllowed => write!(f, "host not in allow-list"),
            NotStarted::NotALocator => write!(f, "host is not a configured locator"),
            NotStarted::EnoughRegistrars { found } => {
                write!(f, "{} registrar(s) already running", found)
            }
            NotStarted::ProbeFailed(e) => write!(f, "registrar probe failed: {}", e),
            NotStarted::LaunchFailed(e) => write!(f, "launch failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub enum BootstrapOutcome {
    Started(ProcessSupervisor),
    NotStarted(NotStarted),
}

impl BootstrapOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, BootstrapOutcome::Started(_))
    }
}

pub struct CoreServicesBootstrap {
    host: HostIdentity,
    probe: Arc<dyn RegistrarProbe>,
    registry: ServiceRegistry,
    command: CommandSpec,
    options: SupervisorOptions,
    probe_timeout: Duration,
}

impl CoreServicesBootstrap {
    pub fn new(
        host: HostIdentity,
        probe: Arc<dyn RegistrarProbe>,
        registry: ServiceRegistry,
        command: CommandSpec,
    ) -> Self {
        Self {
            host,
            probe,
            registry,
            command,
            options: SupervisorOptions::default(),
            probe_timeout: Duration::from_millis(1500),
        }
    }

    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    /// Launch the discovery registrar unless constraints forbid it here or
    /// at least `desired_count` registrars are already reachable.
    pub async fn maybe_start_discovery(
        &self,
        constraints: &DiscoveryConstraints,
        desired_count: usize,
    ) -> BootstrapOutcome {
        if !self.host.allowed_by(&constraints.allowed_hosts) {
            tracing::info!(
                "Not starting discovery on {}: host not in allow-list",
                self.host.hostname
            );
            return BootstrapOutcome::NotStarted(NotStarted::HostNotAllowed);
        }

        // locator names and the probe both resolve through blocking DNS
        let host = self.host.clone();
        let locators = constraints.locators.clone();
        let probe = self.probe.clone();
        let timeout = self.probe_timeout;
        let checked = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            if !locators.is_empty() && !host.matches_locator(&locators, deadline) {
                return Ok(None);
            }
            probe.probe(timeout).map(Some)
        })
        .await;

        let found = match checked {
            Ok(Ok(Some(found))) => found,
            Ok(Ok(None)) => {
                tracing::info!(
                    "Not starting discovery on {}: not one of {:?}",
                    self.host.hostname,
                    constraints.locators
                );
                return BootstrapOutcome::NotStarted(NotStarted::NotALocator);
            }
            Ok(Err(e)) => {
                tracing::warn!("Registrar probe failed: {}", e);
                return BootstrapOutcome::NotStarted(NotStarted::ProbeFailed(e));
            }
            Err(e) => {
                let e = Error::Internal(format!("probe task failed: {}", e));
                tracing::warn!("Registrar probe failed: {}", e);
                return BootstrapOutcome::NotStarted(NotStarted::ProbeFailed(e));
            }
        };
        if found >= desired_count {
            tracing::info!(
                "Found {} registrar(s), {} desired; not starting discovery",
                found,
                desired_count
            );
            return BootstrapOutcome::NotStarted(NotStarted::EnoughRegistrars { found });
        }

        tracing::info!(
            "Found {} of {} registrar(s), starting {} on {}",
            found,
            desired_count,
            self.command.display_name(),
            self.host.hostname
        );
        match ProcessSupervisor::start(&self.command, &self.registry, self.options.clone()) {
            Ok(supervisor) => BootstrapOutcome::Started(supervisor),
            Err(e) => {
                tracing::error!("Failed to start discovery: {}", e);
                BootstrapOutcome::NotStarted(NotStarted::LaunchFailed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryDiscovery;
    use crate::common::Result;

    struct FailingProbe;

    impl RegistrarProbe for FailingProbe {
        fn probe(&self, _timeout: Duration) -> Result<usize> {
            Err(Error::Timeout("probe".into()))
        }
    }

    fn host(name: &str, ip: &str) -> HostIdentity {
        HostIdentity::new(name, vec![ip.parse().unwrap()])
    }

    fn bootstrap(host: HostIdentity, probe: Arc<dyn RegistrarProbe>) -> CoreServicesBootstrap {
        CoreServicesBootstrap::new(
            host,
            probe,
            ServiceRegistry::new(),
            CommandSpec::new("registrar", "sleep").arg("30"),
        )
        .with_probe_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_locator_host() {
        assert_eq!(locator_host("h1:4160"), "h1");
        assert_eq!(locator_host("h1"), "h1");
        assert_eq!(locator_host("10.0.0.1:4160"), "10.0.0.1");
        assert_eq!(locator_host("[::1]:4160"), "::1");
        assert_eq!(locator_host("::1"), "::1");
    }

    #[test]
    fn test_allow_list() {
        let h1 = host("h1", "10.0.0.1");
        assert!(h1.allowed_by(&[]));
        assert!(h1.allowed_by(&["H1".into()]));
        assert!(h1.allowed_by(&["10.0.0.1".into()]));
        assert!(!h1.allowed_by(&["h2".into(), "10.0.0.2".into()]));
    }

    #[test]
    fn test_locator_match() {
        let h1 = host("h1", "10.0.0.1");
        let later = Instant::now() + Duration::from_secs(5);
        assert!(h1.matches_locator(&["h1:4160".into()], later));
        assert!(h1.matches_locator(&["10.0.0.1:4160".into()], later));
        assert!(!h1.matches_locator(&["10.0.0.2:4160".into()], later));
    }

    #[test]
    fn test_locator_names_not_resolved_after_deadline() {
        let local = host("h1", "127.0.0.1");
        let passed = Instant::now();
        // literal names and addresses need no lookup
        assert!(local.matches_locator(&["h1:4160".into()], passed));
        assert!(local.matches_locator(&["127.0.0.1:4160".into()], passed));
        assert!(!local.matches_locator(&["localhost:4160".into()], passed));
    }

    #[tokio::test]
    async fn test_disallowed_host_does_not_probe() {
        let outcome = bootstrap(host("h2", "10.0.0.2"), Arc::new(FailingProbe))
            .maybe_start_discovery(
                &DiscoveryConstraints {
                    allowed_hosts: vec!["h1".into()],
                    locators: vec![],
                },
                1,
            )
            .await;
        assert!(matches!(
            outcome,
            BootstrapOutcome::NotStarted(NotStarted::HostNotAllowed)
        ));
    }

    #[tokio::test]
    async fn test_non_locator_host_skipped() {
        let outcome = bootstrap(host("h2", "10.0.0.2"), Arc::new(FailingProbe))
            .maybe_start_discovery(
                &DiscoveryConstraints {
                    allowed_hosts: vec![],
                    locators: vec!["10.0.0.1:4160".into()],
                },
                1,
            )
            .await;
        assert!(matches!(
            outcome,
            BootstrapOutcome::NotStarted(NotStarted::NotALocator)
        ));
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_started() {
        let outcome = bootstrap(host("h1", "10.0.0.1"), Arc::new(FailingProbe))
            .maybe_start_discovery(&DiscoveryConstraints::default(), 1)
            .await;
        assert!(matches!(
            outcome,
            BootstrapOutcome::NotStarted(NotStarted::ProbeFailed(Error::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_enough_registrars() {
        let discovery = InMemoryDiscovery::new();
        discovery.register_registrar("h9:4160");
        let outcome = bootstrap(host("h1", "10.0.0.1"), Arc::new(discovery))
            .maybe_start_discovery(&DiscoveryConstraints::default(), 1)
            .await;
        assert!(matches!(
            outcome,
            BootstrapOutcome::NotStarted(NotStarted::EnoughRegistrars { found: 1 })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_starts_when_none_found() {
        let discovery = InMemoryDiscovery::new();
        let outcome = bootstrap(host("h1", "10.0.0.1"), Arc::new(discovery))
            .maybe_start_discovery(&DiscoveryConstraints::default(), 1)
            .await;
        let BootstrapOutcome::Started(supervisor) = outcome else {
            panic!("expected started, got {:?}", outcome);
        };
        assert!(supervisor.is_alive());
        supervisor.kill(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_failure_is_not_started() {
        let discovery = InMemoryDiscovery::new();
        let outcome = CoreServicesBootstrap::new(
            host("h1", "10.0.0.1"),
            Arc::new(discovery),
            ServiceRegistry::new(),
            CommandSpec::new("registrar", "/nonexistent/hafleet-registrar"),
        )
        .maybe_start_discovery(&DiscoveryConstraints::default(), 1)
        .await;
        assert!(matches!(
            outcome,
            BootstrapOutcome::NotStarted(NotStarted::LaunchFailed(Error::Launch { .. }))
        ));
    }
}
