// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent settings in `~/.aria2ctl/config.json`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//!
//! ```json
//! {
//!   "host": "127.0.0.1",
//!   "port": 6800,
//!   "secret": "s3cret",
//!   "transport": "json-rpc",
//!   "dir": "/home/me/Downloads",
//!   "options": { "max-concurrent-downloads": 3, "continue": true }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::options::{normalize, OptionMap};
use crate::rpc::TransportKind;
use crate::session::{SessionConfig, DEFAULT_PORT};

const CONFIG_DIR: &str = ".aria2ctl";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
    pub transport: TransportKind,
    /// Path of the `aria2c` executable.
    pub aria2c: PathBuf,
    /// Resubmissions per download.
    pub retry: u32,
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub probe_attempts: u32,
    pub probe_interval_ms: u64,
    /// Default download directory.
    pub dir: Option<String>,
    /// Daemon startup options, also default job options when aria2ctl
    /// starts the daemon itself.
    pub options: OptionMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            secret: None,
            transport: TransportKind::default(),
            aria2c: PathBuf::from("aria2c"),
            retry: 5,
            poll_interval_ms: 500,
            retry_delay_ms: 1000,
            probe_attempts: 20,
            probe_interval_ms: 250,
            dir: None,
            options: OptionMap::new(),
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port,
            secret: self.secret.clone().filter(|s| !s.is_empty()),
            transport: self.transport,
            binary: self.aria2c.clone(),
            options: normalize(self.options.clone()),
            probe_attempts: self.probe_attempts,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            ..SessionConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// `~/.aria2ctl`, created if missing.
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let config_dir = home.join(CONFIG_DIR);
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    }
    Ok(config_dir)
}

pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_dir()?.join(CONFIG_FILE))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &get_config_dir()?.join(CONFIG_FILE))
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 6800);
        assert_eq!(config.transport, TransportKind::JsonRpc);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"port": 6801, "transport": "legacy-rpc", "options": {"max_tries": 3, "continue": true}}"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.port, 6801);
        assert_eq!(config.transport, TransportKind::LegacyRpc);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.retry, 5);

        let session = config.session_config();
        assert_eq!(session.port, 6801);
        assert_eq!(session.options.get("max-tries"), Some(&json!("3")));
        assert_eq!(session.options.get("continue"), Some(&json!("true")));
        assert_eq!(session.probe_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            secret: Some("s3cret".into()),
            dir: Some("/data".into()),
            ..Config::default()
        };

        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn test_empty_secret_is_no_secret() {
        let config = Config {
            secret: Some(String::new()),
            ..Config::default()
        };
        assert!(config.session_config().secret.is_none());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
