use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use libsession::SessionConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // ip:port of the storage web tunnel
    #[serde(default = "default_addr")]
    pub addr: String,
    // worker node names, one storage per node
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub meta_cache: MetaCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Enables the disk tier; each node gets a sub directory.
    pub disk_root: Option<PathBuf>,
    #[serde(default = "default_handle_capacity")]
    pub handle_cache_capacity: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaCacheConfig {
    #[serde(default = "default_location_capacity")]
    pub capacity: u64,
    #[serde(default = "default_location_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_addr() -> String {
    "127.0.0.1:7103".to_string()
}

fn default_nodes() -> Vec<String> {
    vec!["worker-0".to_string(), "worker-1".to_string()]
}

fn default_handle_capacity() -> u64 {
    1024
}

fn default_interval_ms() -> u64 {
    500
}

fn default_location_capacity() -> u64 {
    10_000
}

fn default_location_ttl_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            nodes: default_nodes(),
            storage: StorageConfig::default(),
            session: SessionSection::default(),
            meta_cache: MetaCacheConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_root: None,
            handle_cache_capacity: default_handle_capacity(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_interval_ms(),
            wait_timeout_ms: default_interval_ms(),
        }
    }
}

impl Default for MetaCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_location_capacity(),
            ttl_ms: default_location_ttl_ms(),
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.session.poll_interval_ms),
            wait_timeout: Duration::from_millis(self.session.wait_timeout_ms),
        }
    }

    pub fn location_ttl(&self) -> Duration {
        Duration::from_millis(self.meta_cache.ttl_ms)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    if cfg.nodes.is_empty() {
        anyhow::bail!("config must name at least one node");
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "addr: 0.0.0.0:9000\nnodes: [a, b, c]\nsession:\n  poll_interval_ms: 100\n"
        )
        .unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.addr, "0.0.0.0:9000");
        assert_eq!(cfg.nodes.len(), 3);
        assert_eq!(cfg.session.poll_interval_ms, 100);
        assert_eq!(cfg.session.wait_timeout_ms, 500);
        assert_eq!(cfg.meta_cache.ttl_ms, 5_000);
        assert!(cfg.storage.disk_root.is_none());
        assert_eq!(
            cfg.session_config().poll_interval,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_rejects_empty_nodes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nodes: []").unwrap();
        assert!(load_config(file.path()).is_err());
        assert!(load_config(Path::new("/definitely/missing.yaml")).is_err());
    }
}
