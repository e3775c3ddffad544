//! Integration tests for configuration management
//!
//! These tests verify that configuration files are created, loaded,
//! and modified correctly. They relocate the configuration directory
//! through the environment, so they run one at a time.

use serial_test::serial;
use slymesh::config::{Config, CONFIG_DIR_ENV, DEFAULT_LISTEN_PORT};
use tempfile::TempDir;
use tokio::fs;

struct ConfigDir(TempDir);

impl ConfigDir {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::env::set_var(CONFIG_DIR_ENV, dir.path());
        Self(dir)
    }
}

impl Drop for ConfigDir {
    fn drop(&mut self) {
        std::env::remove_var(CONFIG_DIR_ENV);
    }
}

#[tokio::test]
#[serial]
async fn test_config_creation_and_loading() {
    let dir = ConfigDir::new();

    let config = Config::init().await.unwrap();
    assert_eq!(config.config_path(), dir.0.path().join("config.toml"));

    let loaded = Config::load().await.unwrap();
    assert_eq!(config.listen_port, loaded.listen_port);
    assert_eq!(loaded.listen_port, DEFAULT_LISTEN_PORT);
}

#[tokio::test]
#[serial]
async fn test_load_without_init_fails() {
    let _dir = ConfigDir::new();
    let error = Config::load().await.unwrap_err();
    assert!(error.to_string().contains("slymesh init"));
}

#[tokio::test]
#[serial]
async fn test_share_and_lookup_settings_persist() {
    let _dir = ConfigDir::new();
    let mut config = Config::init().await.unwrap();

    assert!(config.shares().is_empty());
    config.add_share("alice:1", "Photos", chrono::Utc::now());
    config.add_share("alice:2", "Docs", chrono::Utc::now());
    config.add_lookup_server("127.0.0.1:41338");
    config.bandwidth_limit_up = Some(1_000_000);
    config.save().await.unwrap();

    let reloaded = Config::load().await.unwrap();
    assert_eq!(reloaded.shares().len(), 2);
    assert_eq!(reloaded.shares()[1].name, "Docs");
    assert_eq!(reloaded.lookup_servers, vec!["127.0.0.1:41338".to_string()]);
    assert_eq!(reloaded.node_options().unwrap().upload_limit, Some(1_000_000));
}

#[tokio::test]
#[serial]
async fn test_config_data_directory() {
    let dir = ConfigDir::new();
    let config = Config::init().await.unwrap();
    let data_dir = config.data_dir().unwrap();
    assert!(data_dir.exists());
    assert!(data_dir.is_dir());
    assert!(data_dir.starts_with(dir.0.path()));
    assert!(config.identity_path().unwrap().starts_with(dir.0.path()));
}

#[tokio::test]
#[serial]
async fn test_config_serialization() {
    let dir = ConfigDir::new();
    let mut config = Config::init().await.unwrap();
    config.add_share("alice:1", "Photos", chrono::Utc::now());
    config.save().await.unwrap();

    let content = fs::read_to_string(dir.0.path().join("config.toml")).await.unwrap();
    assert!(content.contains("listen_port"));
    assert!(content.contains("[[shares]]"));

    let parsed: toml::Value = toml::from_str(&content).unwrap();
    assert_eq!(parsed["shares"][0]["name"].as_str(), Some("Photos"));
}
