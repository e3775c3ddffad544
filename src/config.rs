//! # Configuration Management
//!
//! This module handles SlyMesh's configuration file, including:
//! - TOML-based node settings
//! - Lookup server addresses and trusted root certificates
//! - Bandwidth limits and blob store quota
//! - The list of shares this node replicates
//!
//! The configuration is stored in a platform-appropriate directory
//! (e.g., `~/.config/slymesh/` on Linux). The `SLYMESH_CONFIG_DIR`
//! environment variable overrides the location, which is what the tests
//! use for isolation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::manager::ManagerOptions;
use crate::node::NodeOptions;
use crate::storage::Quota;

/// Environment variable that relocates the configuration directory.
pub const CONFIG_DIR_ENV: &str = "SLYMESH_CONFIG_DIR";

pub const DEFAULT_LISTEN_PORT: u16 = 41337;
pub const DEFAULT_LOOKUP_PORT: u16 = 41338;

/// Main configuration structure of a SlyMesh node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub listen_port: u16,
    #[serde(default)]
    pub lookup_servers: Vec<String>,
    pub bandwidth_limit_up: Option<u64>,
    pub bandwidth_limit_down: Option<u64>,
    /// Unused blobs are evicted above this many bytes
    pub quota_optimal: Option<u64>,
    /// Any blob is evicted above this many bytes
    pub quota_max: Option<u64>,
    #[serde(default)]
    pub shares: Vec<ShareEntry>,
    /// Paths to root certificates whose subjects we trust
    #[serde(default)]
    pub trusted_roots: Vec<PathBuf>,
    /// Lookup server mode: serve clients that did not authenticate
    #[serde(default)]
    pub accept_anonymous: bool,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

/// A share this node replicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEntry {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Config {
    fn with_path(config_file_path: PathBuf) -> Self {
        Self {
            node_id: String::new(), // Set once the identity exists
            listen_port: DEFAULT_LISTEN_PORT,
            lookup_servers: Vec::new(),
            bandwidth_limit_up: None,
            bandwidth_limit_down: None,
            quota_optimal: None,
            quota_max: None,
            shares: Vec::new(),
            trusted_roots: Vec::new(),
            accept_anonymous: false,
            config_file_path,
        }
    }

    /// Write a default configuration, replacing any existing one.
    pub async fn init() -> Result<Self> {
        let config_dir = Self::config_dir()?;
        tokio::fs::create_dir_all(&config_dir).await?;

        let config = Self::with_path(config_dir.join("config.toml"));
        tokio::fs::create_dir_all(config.data_dir()?).await?;
        config.save().await?;

        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join("config.toml");

        if !config_file.exists() {
            anyhow::bail!("SlyMesh not initialized. Run 'slymesh init' first.");
        }

        let content = tokio::fs::read_to_string(&config_file).await?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", config_file.display()))?;
        config.config_file_path = config_file;

        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    /// Remember a share. Entries are unique by id.
    pub fn add_share(&mut self, id: &str, name: &str, created_at: DateTime<Utc>) -> bool {
        if self.shares.iter().any(|s| s.id == id) {
            return false;
        }
        self.shares.push(ShareEntry {
            id: id.to_string(),
            name: name.to_string(),
            created_at,
        });
        true
    }

    pub fn remove_share(&mut self, id: &str) -> bool {
        let before = self.shares.len();
        self.shares.retain(|s| s.id != id);
        self.shares.len() != before
    }

    pub fn shares(&self) -> &[ShareEntry] {
        &self.shares
    }

    pub fn add_lookup_server(&mut self, address: impl Into<String>) {
        let address = address.into();
        if !self.lookup_servers.contains(&address) {
            self.lookup_servers.push(address);
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn base_dir(&self) -> Result<PathBuf> {
        match self.config_file_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.to_path_buf()),
            _ => Self::config_dir(),
        }
    }

    pub fn identity_path(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("identity.key"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("data"))
    }

    pub fn quota(&self) -> Quota {
        Quota {
            optimal: self.quota_optimal,
            max: self.quota_max,
        }
    }

    /// Node settings derived from this configuration.
    pub fn node_options(&self) -> Result<NodeOptions> {
        Ok(NodeOptions {
            data_dir: self.data_dir()?,
            quota: self.quota(),
            upload_limit: self.bandwidth_limit_up,
            download_limit: self.bandwidth_limit_down,
            manager: ManagerOptions::default(),
        })
    }

    pub fn listen_address(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("slymesh");

        Ok(config_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::with_path(temp_dir.path().join("config.toml"));
        config.node_id = "test_node".to_string();
        (config, temp_dir)
    }

    #[tokio::test]
    async fn test_config_save_and_load() {
        let (mut config, _temp_dir) = create_test_config();
        config.add_lookup_server("lookup.example.org:41338");
        config.quota_max = Some(1 << 30);
        config.save().await.unwrap();

        let content = tokio::fs::read_to_string(&config.config_file_path).await.unwrap();
        let loaded: Config = toml::from_str(&content).unwrap();

        assert_eq!(loaded.node_id, "test_node");
        assert_eq!(loaded.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(loaded.lookup_servers, vec!["lookup.example.org:41338".to_string()]);
        assert_eq!(loaded.quota(), Quota { optimal: None, max: Some(1 << 30) });
        assert!(!loaded.accept_anonymous);
    }

    #[test]
    fn test_shares_are_unique_by_id() {
        let (mut config, _temp_dir) = create_test_config();
        let now = Utc::now();

        assert!(config.add_share("alice:1", "Photos", now));
        assert!(!config.add_share("alice:1", "Photos again", now));
        assert!(config.add_share("alice:2", "Docs", now));
        assert_eq!(config.shares().len(), 2);

        assert!(config.remove_share("alice:1"));
        assert!(!config.remove_share("alice:1"));
        assert_eq!(config.shares()[0].name, "Docs");
    }

    #[test]
    fn test_lookup_servers_are_unique() {
        let (mut config, _temp_dir) = create_test_config();
        config.add_lookup_server("a:1");
        config.add_lookup_server("a:1");
        assert_eq!(config.lookup_servers.len(), 1);
    }

    #[test]
    fn test_paths_follow_config_file() {
        let (config, temp_dir) = create_test_config();

        assert_eq!(config.config_path(), temp_dir.path().join("config.toml"));
        assert_eq!(config.identity_path().unwrap(), temp_dir.path().join("identity.key"));
        assert_eq!(config.data_dir().unwrap(), temp_dir.path().join("data"));
        assert_eq!(config.node_options().unwrap().data_dir, temp_dir.path().join("data"));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let config: Config = toml::from_str(
            r#"
            node_id = "x"
            listen_port = 1
            "#,
        )
        .unwrap();
        assert!(config.shares.is_empty());
        assert!(config.trusted_roots.is_empty());
        assert_eq!(config.quota(), Quota::default());
    }
}
