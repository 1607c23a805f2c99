//! Configuration for the provisioning core.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::error::{Result, VirtLabError};
use crate::retry::RetryPolicy;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Control-plane driver selection
    pub driver: DriverConfig,
    /// Retry budget for control-plane calls
    pub retry: RetryConfig,
    /// Snapshot handling
    pub snapshot: SnapshotConfig,
    /// Management address pool
    pub pool: PoolConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VirtLabError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            VirtLabError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })
    }
}

/// Driver backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverBackend {
    /// In-memory mock (testing/dev)
    Mock,
    /// Libvirt daemon (requires the `libvirt` feature)
    Libvirt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub backend: DriverBackend,
    /// Connection URI for the libvirt backend
    pub uri: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: DriverBackend::Mock,
            uri: "qemu:///system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per control-plane call, including the first
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_secs: 1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.delay_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory external overlay and memory files are created under
    pub external_dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            external_dir: PathBuf::from("/var/lib/virtlab/snapshots"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Base CIDR blocks subnets are carved out of
    pub base_ranges: Vec<Ipv4Net>,
    /// Prefix length of the carved subnets
    pub prefix_len: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_ranges: vec!["10.0.0.0/16".parse().expect("valid literal")],
            prefix_len: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.driver.backend, DriverBackend::Mock);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.pool.prefix_len, 24);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let yaml = r#"
retry:
  max_attempts: 3
pool:
  base_ranges: ["192.168.0.0/20"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_secs, 1);
        assert_eq!(config.pool.base_ranges.len(), 1);
        assert_eq!(config.driver.backend, DriverBackend::Mock);
    }
}
