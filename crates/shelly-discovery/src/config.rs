//! Scanner configuration loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::coiot::{COIOT_GROUP, COIOT_PORT};
use crate::mdns::SHELLY_SERVICE;

/// Which protocols a [`crate::Scanner`] runs, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    #[serde(default = "default_true")]
    pub enable_coiot: bool,
    /// Needs a platform BLE scanner
    #[serde(default = "default_true")]
    pub enable_ble: bool,
    /// Needs a platform WiFi scanner
    #[serde(default = "default_true")]
    pub enable_wifi_ap: bool,
    /// Join each device AP to identify it; the host leaves its network meanwhile
    #[serde(default)]
    pub probe_wifi_devices: bool,
    /// Accept BLE advertisements that only carry BTHome data
    #[serde(default = "default_true")]
    pub ble_include_bthome: bool,
    #[serde(default = "default_mdns_service")]
    pub mdns_service: String,
    #[serde(default = "default_coiot_group")]
    pub coiot_group: Ipv4Addr,
    #[serde(default = "default_coiot_port")]
    pub coiot_port: u16,
    /// Wait after joining a device AP before identifying it
    #[serde(default = "default_settle_ms")]
    pub wifi_probe_settle_ms: u64,
    /// Per-request timeout for HTTP identification
    #[serde(default = "default_identify_timeout_ms")]
    pub identify_timeout_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            enable_coiot: true,
            enable_ble: true,
            enable_wifi_ap: true,
            probe_wifi_devices: false,
            ble_include_bthome: true,
            mdns_service: default_mdns_service(),
            coiot_group: default_coiot_group(),
            coiot_port: default_coiot_port(),
            wifi_probe_settle_ms: default_settle_ms(),
            identify_timeout_ms: default_identify_timeout_ms(),
        }
    }
}

impl ScannerConfig {
    pub fn wifi_probe_settle(&self) -> Duration {
        Duration::from_millis(self.wifi_probe_settle_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_mdns_service() -> String {
    SHELLY_SERVICE.to_string()
}

fn default_coiot_group() -> Ipv4Addr {
    COIOT_GROUP
}

fn default_coiot_port() -> u16 {
    COIOT_PORT
}

fn default_settle_ms() -> u64 {
    3000
}

fn default_identify_timeout_ms() -> u64 {
    5000
}

/// Load configuration from file
///
/// A missing file yields the defaults; an unreadable or invalid one is an
/// error.
pub fn load_config(path: &Path) -> Result<ScannerConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: ScannerConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Loaded scanner configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(ScannerConfig::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&ScannerConfig::default())?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ScannerConfig::default());
        assert_eq!(config.coiot_group, Ipv4Addr::new(224, 0, 1, 187));
        assert!(!config.probe_wifi_devices);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner.toml");
        std::fs::write(
            &path,
            "enable_ble = false\nprobe_wifi_devices = true\ncoiot_port = 15683\nwifi_probe_settle_ms = 500\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(!config.enable_ble);
        assert!(config.probe_wifi_devices);
        assert_eq!(config.coiot_port, 15683);
        assert_eq!(config.wifi_probe_settle(), Duration::from_millis(500));
        assert!(config.enable_mdns);
        assert_eq!(config.mdns_service, "_shelly._tcp.local.");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner.toml");
        std::fs::write(&path, "enable_mdns = \"sometimes\"").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_saved_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner.toml");
        save_default_config(&path).unwrap();
        assert_eq!(load_config(&path).unwrap(), ScannerConfig::default());
    }
}
