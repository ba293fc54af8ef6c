use std::collections::HashMap;
use std::fs::read_to_string;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::log::{FlowControlOptions, LogStreamOptions};
use crate::restore::{Membership, RestoreOptions};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/flowlog/config.toml";

pub static CONFIG: Lazy<RwLock<Configuration>> = Lazy::new(|| RwLock::new(Default::default()));

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/flowlog".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct Configuration {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionConfig>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            name: String::new(),
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            partitions: vec![],
            log: Default::default(),
            restore: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PartitionConfig {
    pub id: u32,
    /// Endpoint URI of this partition's current leader, absent when this
    /// member is the leader itself.
    pub leader: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub block_index_capacity: usize,
    pub max_inflight_appends: usize,
    pub max_appends_per_second: Option<u32>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            block_index_capacity: 4096,
            max_inflight_appends: 1024,
            max_appends_per_second: None,
        }
    }
}

impl LogConfig {
    pub fn options(&self) -> LogStreamOptions {
        LogStreamOptions::builder()
            .block_index_capacity(self.block_index_capacity)
            .flow_control(
                FlowControlOptions::builder()
                    .max_inflight_appends(self.max_inflight_appends)
                    .max_appends_per_second(self.max_appends_per_second)
                    .build(),
            )
            .build()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RestoreConfig {
    pub max_entries_per_request: u32,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        RestoreConfig {
            max_entries_per_request: 100,
            max_attempts: 10,
            backoff_initial_ms: 100,
            backoff_max_ms: 5000,
            request_timeout_ms: 5000,
        }
    }
}

impl RestoreConfig {
    pub fn options(&self) -> RestoreOptions {
        RestoreOptions::builder()
            .max_entries_per_request(self.max_entries_per_request)
            .max_attempts(self.max_attempts)
            .backoff_initial(Duration::from_millis(self.backoff_initial_ms))
            .backoff_max(Duration::from_millis(self.backoff_max_ms))
            .build()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Leader addressing read once from the configuration file.
pub struct ConfigMembership {
    leaders: HashMap<u32, String>,
}

impl ConfigMembership {
    pub fn from_config(config: &Configuration) -> Self {
        let leaders = config
            .partitions
            .iter()
            .filter_map(|p| p.leader.clone().map(|l| (p.id, l)))
            .collect();
        ConfigMembership { leaders }
    }
}

impl Membership for ConfigMembership {
    fn resolve_leader(&self, partition_id: u32) -> Option<String> {
        self.leaders.get(&partition_id).cloned()
    }
}

fn validate_configuration(config: &Configuration) -> Result<()> {
    if config.listen_addr.parse::<SocketAddr>().is_err() {
        bail!("invalid listen_addr: {}", config.listen_addr);
    }

    if config.log.max_appends_per_second == Some(0) {
        bail!("log.max_appends_per_second must be positive when set");
    }

    let mut seen = std::collections::HashSet::new();
    for p in &config.partitions {
        if !seen.insert(p.id) {
            bail!("duplicate partition id: {}", p.id);
        }
    }

    Ok(())
}

pub fn init_config(file: &str) -> Result<()> {
    info!("parsing configuration file: {file}");

    let contents = read_to_string(file)
        .with_context(|| format!("failed to read configuration file {file}"))?;
    let conf: Configuration =
        toml::from_str(&contents).context("failed to parse configuration file")?;

    validate_configuration(&conf)?;

    *CONFIG.write() = conf;

    info!("successfully initialized config module");
    debug!("configuration: {:?}", *CONFIG.read());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
name = "node-1"
listen_addr = "0.0.0.0:9999"
data_dir = "/tmp/flowlog-test"

[log]
block_index_capacity = 128
max_appends_per_second = 500

[restore]
max_entries_per_request = 50

[[partition]]
id = 1
leader = "http://10.0.0.1:9090"

[[partition]]
id = 2
"#;

    #[test]
    fn test_parse_example() {
        let config: Configuration = toml::from_str(EXAMPLE).unwrap();

        assert_eq!(config.name, "node-1");
        assert_eq!(config.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.log.block_index_capacity, 128);
        assert_eq!(config.log.max_appends_per_second, Some(500));
        // Unset sections and fields fall back to their defaults.
        assert_eq!(config.log.max_inflight_appends, 1024);
        assert_eq!(config.restore.max_entries_per_request, 50);
        assert_eq!(config.restore.max_attempts, 10);

        assert_eq!(config.partitions.len(), 2);
        assert_eq!(config.partitions[0].id, 1);
        assert_eq!(
            config.partitions[0].leader.as_deref(),
            Some("http://10.0.0.1:9090")
        );
        assert_eq!(config.partitions[1].leader, None);

        validate_configuration(&config).unwrap();
    }

    #[test]
    fn test_defaults_are_valid() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9090");
        validate_configuration(&config).unwrap();
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let config: Configuration = toml::from_str("listen_addr = \"not an addr\"").unwrap();
        assert!(validate_configuration(&config).is_err());
    }

    #[test]
    fn test_zero_append_rate_rejected() {
        let config: Configuration =
            toml::from_str("[log]\nmax_appends_per_second = 0\n").unwrap();
        assert!(validate_configuration(&config).is_err());
    }

    #[test]
    fn test_duplicate_partition_rejected() {
        let config: Configuration =
            toml::from_str("[[partition]]\nid = 1\n[[partition]]\nid = 1\n").unwrap();
        assert!(validate_configuration(&config).is_err());
    }

    #[test]
    fn test_membership_resolution() {
        let config: Configuration = toml::from_str(EXAMPLE).unwrap();
        let membership = ConfigMembership::from_config(&config);

        assert_eq!(
            membership.resolve_leader(1).as_deref(),
            Some("http://10.0.0.1:9090")
        );
        assert_eq!(membership.resolve_leader(2), None);
        assert_eq!(membership.resolve_leader(99), None);
    }
}
