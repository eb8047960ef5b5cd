//! Service discovery collaborators
//!
//! The fleet only needs two things from discovery: how many registrars are
//! reachable right now, and whether a service matching a template has joined.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Attribute a replica advertises so its coordinator can recognise it
pub const INSTANCE_ATTRIBUTE: &str = "hafleet.instance";

/// Counts discovery registrars visible from this host.
pub trait RegistrarProbe: Send + Sync {
    /// Number of registrars found within `timeout`. May block up to `timeout`.
    fn probe(&self, timeout: Duration) -> Result<usize>;
}

/// Directory of joined services.
pub trait ServiceDirectory: Send + Sync {
    fn lookup(&self, template: &ServiceTemplate) -> Vec<ServiceItem>;

    /// Bumped on every registration change
    fn changes(&self) -> watch::Receiver<u64>;
}

/// A joined service and its advertised attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub service_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ServiceItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            service_id: Uuid::new_v4(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Template match: every set field must equal the item's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTemplate {
    pub service_id: Option<Uuid>,
    pub name: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ServiceTemplate {
    pub fn by_attribute(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(key.into(), value.into());
        Self {
            attributes,
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &ServiceItem) -> bool {
        if self.service_id.is_some_and(|id| id != item.service_id) {
            return false;
        }
        if self.name.as_ref().is_some_and(|n| n != &item.name) {
            return false;
        }
        self.attributes
            .iter()
            .all(|(k, v)| item.attributes.get(k) == Some(v))
    }
}

/// Wait until a service matching `template` has joined.
pub async fn await_match(
    directory: &dyn ServiceDirectory,
    template: &ServiceTemplate,
    timeout: Duration,
) -> Result<ServiceItem> {
    let deadline = tokio::time::Instant::now() + timeout;
    // subscribe before the first lookup so no registration slips between
    let mut changes = directory.changes();
    loop {
        if let Some(item) = directory.lookup(template).into_iter().next() {
            return Ok(item);
        }
        match tokio::time::timeout_at(deadline, changes.changed()).await {
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "no service matching {:?} joined within {:?}",
                    template.attributes, timeout
                )))
            }
            Ok(Err(_)) => return Err(Error::Internal("service directory closed".into())),
            Ok(Ok(())) => continue,
        }
    }
}

#[derive(Default)]
struct DiscoveryState {
    registrars: BTreeSet<String>,
    services: BTreeMap<Uuid, ServiceItem>,
}

/// In-process discovery: registrars and services are registered explicitly.
#[derive(Clone)]
pub struct InMemoryDiscovery {
    state: Arc<Mutex<DiscoveryState>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(DiscoveryState::default())),
            version: Arc::new(version),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    pub fn register_registrar(&self, locator: impl Into<String>) {
        let locator = locator.into();
        tracing::info!("Registrar announced at {}", locator);
        self.lock().registrars.insert(locator);
        self.bump();
    }

    pub fn unregister_registrar(&self, locator: &str) {
        self.lock().registrars.remove(locator);
        self.bump();
    }

    pub fn register(&self, item: ServiceItem) {
        tracing::debug!("Service {} ({}) joined", item.name, item.service_id);
        self.lock().services.insert(item.service_id, item);
        self.bump();
    }

    pub fn unregister(&self, service_id: &Uuid) {
        self.lock().services.remove(service_id);
        self.bump();
    }
}

impl RegistrarProbe for InMemoryDiscovery {
    fn probe(&self, _timeout: Duration) -> Result<usize> {
        Ok(self.lock().registrars.len())
    }
}

impl ServiceDirectory for InMemoryDiscovery {
    fn lookup(&self, template: &ServiceTemplate) -> Vec<ServiceItem> {
        self.lock()
            .services
            .values()
            .filter(|item| template.matches(item))
            .cloned()
            .collect()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Probes unicast locators (`host:port`) by TCP connect. All locators share
/// one overall timeout budget.
#[derive(Debug, Clone)]
pub struct UnicastProbe {
    locators: Vec<String>,
}

impl UnicastProbe {
    pub fn new(locators: Vec<String>) -> Self {
        Self { locators }
    }
}

impl RegistrarProbe for UnicastProbe {
    fn probe(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut found = 0;
        for locator in &self.locators {
            if Instant::now() >= deadline {
                tracing::debug!("Probe deadline passed before {}", locator);
                return Ok(found);
            }
            let addrs = match locator.to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::debug!("Cannot resolve locator {}: {}", locator, e);
                    continue;
                }
            };
            for addr in addrs {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(found);
                }
                if TcpStream::connect_timeout(&addr, remaining).is_ok() {
                    tracing::debug!("Registrar reachable at {}", addr);
                    found += 1;
                    break;
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_matching() {
        let item = ServiceItem::new("journal").with_attribute(INSTANCE_ATTRIBUTE, "/a/b");
        assert!(ServiceTemplate::default().matches(&item));
        assert!(ServiceTemplate::by_attribute(INSTANCE_ATTRIBUTE, "/a/b").matches(&item));
        assert!(!ServiceTemplate::by_attribute(INSTANCE_ATTRIBUTE, "/a/c").matches(&item));

        let by_id = ServiceTemplate {
            service_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(!by_id.matches(&item));
    }

    #[test]
    fn test_registrar_count() {
        let discovery = InMemoryDiscovery::new();
        assert_eq!(discovery.probe(Duration::from_millis(10)).unwrap(), 0);
        discovery.register_registrar("h1:4160");
        discovery.register_registrar("h1:4160");
        discovery.register_registrar("h2:4160");
        assert_eq!(discovery.probe(Duration::from_millis(10)).unwrap(), 2);
        discovery.unregister_registrar("h2:4160");
        assert_eq!(discovery.probe(Duration::from_millis(10)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_await_match_sees_later_join() {
        let discovery = InMemoryDiscovery::new();
        let template = ServiceTemplate::by_attribute(INSTANCE_ATTRIBUTE, "/svc/i1");

        let joiner = discovery.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            joiner.register(ServiceItem::new("other"));
            joiner.register(ServiceItem::new("journal").with_attribute(INSTANCE_ATTRIBUTE, "/svc/i1"));
        });

        let item = await_match(&discovery, &template, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(item.name, "journal");
    }

    #[tokio::test]
    async fn test_await_match_times_out() {
        let discovery = InMemoryDiscovery::new();
        let template = ServiceTemplate::by_attribute(INSTANCE_ATTRIBUTE, "/svc/none");
        let err = await_match(&discovery, &template, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_unicast_probe_counts_listeners() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().to_string();
        let probe = UnicastProbe::new(vec![live, "unresolvable.invalid:4160".into()]);
        assert_eq!(probe.probe(Duration::from_millis(500)).unwrap(), 1);
    }

    #[test]
    fn test_unicast_probe_stops_at_deadline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().to_string();
        let probe = UnicastProbe::new(vec![live]);
        assert_eq!(probe.probe(Duration::ZERO).unwrap(), 0);
    }
}
