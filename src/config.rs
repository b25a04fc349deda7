use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidewallet_sdk::{Network, WalletConfig};

const CONFIG_FILE: &str = "network_config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-network server overrides. Unset fields use the network defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub electrum_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxi_url: Option<String>,
}

/// Host settings persisted as JSON in the data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub network: Network,
    #[serde(default)]
    pub endpoints: BTreeMap<Network, Endpoints>,
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
}

fn default_gap_limit() -> u32 {
    tidewallet_sdk::config::DEFAULT_GAP_LIMIT
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            network: Network::Liquid,
            endpoints: BTreeMap::new(),
            gap_limit: default_gap_limit(),
        }
    }
}

impl HostConfig {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// True until a configuration has been saved to `data_dir`.
    pub fn is_first_launch(data_dir: &Path) -> bool {
        !Self::path(data_dir).exists()
    }

    /// Read the saved configuration. A missing or unreadable file yields
    /// the defaults.
    pub fn load(data_dir: &Path) -> Self {
        let path = Self::path(data_dir);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring corrupt {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        fs::create_dir_all(data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(Self::path(data_dir), json)?;
        Ok(())
    }

    pub fn endpoints_for(&self, network: Network) -> Endpoints {
        self.endpoints.get(&network).cloned().unwrap_or_default()
    }

    pub fn set_electrum_url(&mut self, network: Network, url: Option<String>) {
        self.endpoints.entry(network).or_default().electrum_url = url;
    }

    /// Engine configuration for `network` with this host's overrides.
    pub fn wallet_config(&self, network: Network) -> WalletConfig {
        let endpoints = self.endpoints_for(network);
        WalletConfig {
            electrum_url: endpoints.electrum_url,
            taxi_url: endpoints.taxi_url,
            gap_limit: self.gap_limit,
            ..WalletConfig::new(network)
        }
    }
}
