//! Configuration management for stratum-switcher.
//!
//! The daemon reads one JSON file at startup. Key names follow the
//! deployment's existing configuration files (`ServerID`, `ZKBroker`, ...),
//! so every field carries an explicit rename.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing_subscriber::filter::LevelFilter;

use crate::error::{Error, Result};
use crate::types::ChainType;
use crate::watch::MEMORY_BROKER;

/// Main configuration structure for the switcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Session-id prefix; 0 means "assign one from the watch store".
    #[serde(rename = "ServerID", default)]
    pub server_id: u8,

    #[serde(rename = "ChainType")]
    pub chain_type: ChainType,

    /// Address miners connect to
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,

    /// Coin name to back-end pool server
    #[serde(rename = "StratumServerMap")]
    pub stratum_servers: HashMap<String, StratumServerInfo>,

    /// Watch store endpoints, or `["memory"]` for the in-process store
    #[serde(rename = "ZKBroker")]
    pub zk_brokers: Vec<String>,

    /// Directory of per-subaccount coin assignments
    #[serde(rename = "ZKSwitcherWatchDir")]
    pub zk_switcher_watch_dir: String,

    /// Directory of ephemeral server-id claims
    #[serde(rename = "ZKServerIDAssignDir", default = "default_server_id_assign_dir")]
    pub zk_server_id_assign_dir: String,

    /// Index mapping lowercase subaccount names to canonical ones
    #[serde(rename = "ZKUserCaseInsensitiveIndex", default)]
    pub zk_user_case_insensitive_index: Option<String>,

    #[serde(rename = "EnableUserAutoReg", default)]
    pub enable_user_auto_reg: bool,

    #[serde(rename = "ZKAutoRegWatchDir", default)]
    pub zk_auto_reg_watch_dir: String,

    /// Concurrent auto-registration waits allowed
    #[serde(rename = "AutoRegMaxWaitUsers", default)]
    pub auto_reg_max_wait_users: usize,

    #[serde(rename = "EnableHTTPDebug", default)]
    pub enable_http_debug: bool,

    #[serde(rename = "HTTPDebugListenAddr", default)]
    pub http_debug_listen_addr: String,

    #[serde(rename = "LogLevel", default = "default_log_level")]
    pub log_level: String,
}

/// One back-end pool server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StratumServerInfo {
    /// `host:port`
    #[serde(rename = "URL")]
    pub url: String,

    /// Appended to subaccount names as `<subaccount>_<suffix>`; defaults to
    /// the coin name.
    #[serde(rename = "UserSuffix", default)]
    pub user_suffix: String,
}

fn default_server_id_assign_dir() -> String {
    "/stratumSwitcher/serverIDs/".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn with_trailing_slash(dir: &mut String) {
    if !dir.ends_with('/') {
        dir.push('/');
    }
}

impl Config {
    /// Load configuration from the given path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Parse, normalize and validate a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        with_trailing_slash(&mut self.zk_switcher_watch_dir);
        with_trailing_slash(&mut self.zk_server_id_assign_dir);
        if self.enable_user_auto_reg {
            with_trailing_slash(&mut self.zk_auto_reg_watch_dir);
        }
        self.zk_user_case_insensitive_index = self
            .zk_user_case_insensitive_index
            .take()
            .filter(|index| !index.is_empty())
            .map(|mut index| {
                with_trailing_slash(&mut index);
                index
            });
        for (coin, server) in self.stratum_servers.iter_mut() {
            if server.user_suffix.is_empty() {
                server.user_suffix = coin.clone();
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Config("ListenAddr is required".into()));
        }
        if self.stratum_servers.is_empty() {
            return Err(Error::Config("StratumServerMap is empty".into()));
        }
        if self.zk_brokers.is_empty() {
            return Err(Error::Config("ZKBroker is empty".into()));
        }
        if self.enable_user_auto_reg && self.zk_auto_reg_watch_dir.is_empty() {
            return Err(Error::Config(
                "EnableUserAutoReg requires ZKAutoRegWatchDir".into(),
            ));
        }
        if self.enable_http_debug && self.http_debug_listen_addr.is_empty() {
            return Err(Error::Config(
                "EnableHTTPDebug requires HTTPDebugListenAddr".into(),
            ));
        }
        Ok(())
    }

    /// Whether the in-process watch store was requested.
    pub fn uses_memory_store(&self) -> bool {
        matches!(self.zk_brokers.as_slice(), [broker] if broker == MEMORY_BROKER)
    }

    pub fn log_level(&self) -> LevelFilter {
        crate::tracing::parse_level(&self.log_level)
    }

    /// Watch-store key holding the coin of `subaccount`.
    pub fn coin_path(&self, subaccount: &str) -> String {
        format!("{}{}", self.zk_switcher_watch_dir, subaccount)
    }
}
