//! Configuration for hafleet components

use crate::common::utils::{local_hostname, parse_duration};
use crate::common::{Error, Result};
use crate::process::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Node ID (unique identifier of this agent)
    #[serde(default = "local_hostname")]
    pub node_id: String,

    /// Host name used for discovery constraints
    #[serde(default = "local_hostname")]
    pub hostname: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logical services this agent starts replicas for
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub snapshots: SnapshotConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Coordination namespace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Root path of the fleet in the coordination namespace
    #[serde(default = "default_root")]
    pub root: String,
}

fn default_root() -> String {
    "/hafleet".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

/// Process supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Number of output lines echoed to the console per process
    #[serde(default = "default_echo_lines")]
    pub echo_lines: usize,

    /// Grace period before a graceful kill escalates to a forced one
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_ms: u64,

    /// Directory receiving one output log file per supervised process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_echo_lines() -> usize {
    20
}
fn default_graceful_timeout() -> u64 {
    5_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            echo_lines: default_echo_lines(),
            graceful_timeout_ms: default_graceful_timeout(),
            log_dir: None,
        }
    }
}

/// Discovery bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Hosts allowed to run the registrar (empty = any host)
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Unicast locators as `host:port` (empty = multicast discovery)
    #[serde(default)]
    pub locators: Vec<String>,

    /// Number of registrars the fleet wants
    #[serde(default = "default_desired_registrars")]
    pub desired_registrars: usize,

    /// Registrar probe timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Registrar process to launch (bootstrap is skipped when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
}

fn default_desired_registrars() -> usize {
    1
}
fn default_probe_timeout() -> u64 {
    1_500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            locators: Vec::new(),
            desired_registrars: default_desired_registrars(),
            probe_timeout_ms: default_probe_timeout(),
            command: None,
        }
    }
}

/// One logical service and how to launch its replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Desired number of physical instances
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    pub command: CommandSpec,

    /// How long a new replica may take to join discovery
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    #[serde(default)]
    pub join: JoinMode,
}

/// Who announces a replica to discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// The agent announces the replica as soon as its process is up
    #[default]
    OnSpawn,
    /// The replica registers itself
    External,
}

fn default_replication_factor() -> usize {
    3
}
fn default_join_timeout() -> u64 {
    30_000
}

/// Snapshot catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,

    /// Newest snapshots always retained by pruning
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,

    /// Maximum age of retained snapshots (e.g. "7d"); unset keeps everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./snapshots")
}
fn default_keep_last() -> usize {
    2
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            keep_last: default_keep_last(),
            max_age: None,
        }
    }
}

impl SnapshotConfig {
    pub fn max_age(&self) -> Result<Option<Duration>> {
        self.max_age.as_deref().map(parse_duration).transpose()
    }

    /// Apply command line values on top of the configured ones.
    pub fn with_overrides(
        mut self,
        dir: Option<PathBuf>,
        keep_last: Option<usize>,
        max_age: Option<String>,
    ) -> Result<Self> {
        if let Some(dir) = dir {
            self.dir = dir;
        }
        if let Some(keep_last) = keep_last {
            self.keep_last = keep_last;
        }
        if max_age.is_some() {
            self.max_age = max_age;
        }
        self.max_age()?;
        Ok(self)
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            node_id: local_hostname(),
            hostname: local_hostname(),
            log_level: default_log_level(),
            coordination: CoordinationConfig::default(),
            supervisor: SupervisorConfig::default(),
            discovery: DiscoveryConfig::default(),
            services: Vec::new(),
            snapshots: SnapshotConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from an optional TOML file, then `HAFLEET_*`
    /// environment overrides (nested keys separated by `__`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: FleetConfig = builder
            .add_source(config::Environment::with_prefix("HAFLEET").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.coordination.root.starts_with('/') || self.coordination.root.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "coordination root must be an absolute non-root path: {}",
                self.coordination.root
            )));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() || service.name.contains('/') {
                return Err(Error::InvalidConfig(format!(
                    "invalid service name: {:?}",
                    service.name
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate service: {}",
                    service.name
                )));
            }
            if service.replication_factor == 0 {
                return Err(Error::InvalidConfig(format!(
                    "service {} needs a replication factor of at least 1",
                    service.name
                )));
            }
            service.command.validate()?;
        }

        if let Some(command) = &self.discovery.command {
            command.validate()?;
        }
        self.snapshots.max_age()?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.probe_timeout_ms)
    }
}

impl ServiceConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = FleetConfig::default();
        assert_eq!(config.coordination.root, "/hafleet");
        assert_eq!(config.discovery.desired_registrars, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = "agent-1"
hostname = "h1"

[discovery]
allowed_hosts = ["h1", "h2"]
probe_timeout_ms = 250

[[services]]
name = "journal"
replication_factor = 3
command = {{ program = "sleep", args = ["60"] }}

[snapshots]
dir = "/var/lib/hafleet/snapshots"
max_age = "7d"
"#
        )
        .unwrap();

        let config = FleetConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "agent-1");
        assert_eq!(config.discovery.allowed_hosts.len(), 2);
        assert_eq!(config.probe_timeout(), Duration::from_millis(250));
        assert_eq!(config.services[0].replication_factor, 3);
        assert_eq!(config.services[0].join_timeout(), Duration::from_secs(30));
        assert_eq!(config.services[0].join, JoinMode::OnSpawn);
        assert_eq!(
            config.snapshots.max_age().unwrap(),
            Some(Duration::from_secs(7 * 86400))
        );
        assert_eq!(config.snapshots.dir, PathBuf::from("/var/lib/hafleet/snapshots"));
        assert_eq!(config.snapshots.keep_last, 2);
    }

    #[test]
    fn test_snapshot_overrides() {
        let configured = SnapshotConfig {
            dir: PathBuf::from("/data/snaps"),
            keep_last: 5,
            max_age: Some("7d".into()),
        };

        let unchanged = configured.clone().with_overrides(None, None, None).unwrap();
        assert_eq!(unchanged.dir, PathBuf::from("/data/snaps"));
        assert_eq!(unchanged.keep_last, 5);
        assert_eq!(unchanged.max_age().unwrap(), Some(Duration::from_secs(7 * 86400)));

        let overridden = configured
            .clone()
            .with_overrides(Some("/tmp/snaps".into()), Some(1), Some("1h".into()))
            .unwrap();
        assert_eq!(overridden.dir, PathBuf::from("/tmp/snaps"));
        assert_eq!(overridden.keep_last, 1);
        assert_eq!(overridden.max_age().unwrap(), Some(Duration::from_secs(3600)));

        assert!(configured
            .with_overrides(None, None, Some("soon".into()))
            .is_err());
    }

    #[test]
    fn test_rejects_duplicate_services() {
        let service = ServiceConfig {
            name: "journal".into(),
            replication_factor: 1,
            command: CommandSpec::new("journal", "true"),
            join_timeout_ms: 1_000,
            join: JoinMode::OnSpawn,
        };
        let config = FleetConfig {
            services: vec![service.clone(), service],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_replication() {
        let config = FleetConfig {
            services: vec![ServiceConfig {
                name: "journal".into(),
                replication_factor: 0,
                command: CommandSpec::new("journal", "true"),
                join_timeout_ms: 1_000,
                join: JoinMode::External,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
