// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{Context, Result};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::{config::PREFERRED_MTU, naming::MAX_NAME_LENGTH};
use crate::bluetooth::CommunicatorConfig;

const APP_DIR: &str = "ble-communicator";

/// Get a sanitized hostname usable as a logical name.
/// Only alphanumeric chars and hyphens are kept, and the result fits
/// the advertised name limit.
fn get_sanitized_hostname() -> String {
    let hostname = gethostname().to_string_lossy().to_string();
    let sanitized: String = hostname
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "Desktop".to_string()
    } else {
        truncate(trimmed, MAX_NAME_LENGTH).to_string()
    }
}

/// Cut `name` to at most `max` bytes on a char boundary.
fn truncate(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Connection timing and MTU.
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Logical name; a two digit id is appended when advertising.
    pub device_name: String,

    /// Accept every inbound connection request.
    pub auto_accept: bool,

    /// Connect to every peer discovery finds.
    pub auto_connect: bool,

    /// Start advertising on launch.
    pub advertise: bool,

    /// Start discovery on launch.
    pub discover: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: get_sanitized_hostname(),
            auto_accept: true,
            auto_connect: false,
            advertise: true,
            discover: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub preferred_mtu: usize,
    pub connection_timeout_ms: u64,
    pub reconnection_timeout_ms: u64,
    pub disconnection_timeout_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            preferred_mtu: PREFERRED_MTU,
            connection_timeout_ms: 10_000,
            reconnection_timeout_ms: 20_000,
            disconnection_timeout_ms: 5_000,
            tick_interval_ms: 250,
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Settings consumed by the communicator core.
    pub fn communicator_config(&self) -> CommunicatorConfig {
        let connection = &self.connection;
        CommunicatorConfig {
            name: self.bluetooth.device_name.clone(),
            preferred_mtu: connection.preferred_mtu,
            connection_timeout: Duration::from_millis(connection.connection_timeout_ms),
            reconnection_timeout: Duration::from_millis(connection.reconnection_timeout_ms),
            disconnection_timeout: Duration::from_millis(connection.disconnection_timeout_ms),
            tick_interval: Duration::from_millis(connection.tick_interval_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_name_is_advertisable() {
        let name = get_sanitized_hostname();
        assert!(!name.is_empty());
        assert!(name.len() <= MAX_NAME_LENGTH);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("workstation-number-one", 16), "workstation-numb");
        assert_eq!(truncate("short", 16), "short");
        // 'é' is two bytes; cutting at 2 would split it
        assert_eq!(truncate("aéb", 2), "a");
    }

    #[test]
    fn test_load_creates_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.connection.preferred_mtu, 185);
        assert!(config.bluetooth.auto_accept);

        let communicator = config.communicator_config();
        assert_eq!(communicator.connection_timeout, Duration::from_secs(10));
        assert_eq!(communicator.reconnection_timeout, Duration::from_secs(20));
        assert_eq!(communicator.disconnection_timeout, Duration::from_secs(5));
        assert_eq!(communicator.tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bluetooth]\ndevice_name = \"Kitchen\"\nauto_connect = true\n\n[connection]\nreconnection_timeout_ms = 3000\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bluetooth.device_name, "Kitchen");
        assert!(config.bluetooth.auto_connect);
        assert!(config.bluetooth.advertise);
        assert_eq!(config.connection.reconnection_timeout_ms, 3000);
        assert_eq!(config.connection.connection_timeout_ms, 10_000);
        assert_eq!(config.communicator_config().name, "Kitchen");
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.bluetooth.device_name = "Desk".to_string();
        config.bluetooth.discover = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.bluetooth.device_name, "Desk");
        assert!(loaded.bluetooth.discover);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bluetooth\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
