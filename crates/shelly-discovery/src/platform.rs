//! Platform radio interfaces consumed by the BLE and WiFi discoverers
//!
//! WiFi and BLE access is OS-specific. The discoverers only talk to these
//! traits; adapters that drive `nmcli`, `netsh`, `networksetup` or a BLE
//! radio stack implement them outside this crate, and tests use fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// One WiFi network seen by a scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WiFiNetwork {
    pub ssid: String,
    pub bssid: String,
    /// Signal strength in dBm (or percent, platform dependent)
    pub signal: i32,
    pub channel: u32,
    /// Security description as reported by the platform (e.g. "WPA2", "Open")
    pub security: String,
    /// Set by classification when the SSID matches the device AP pattern
    #[serde(default)]
    pub is_shelly: bool,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub device_id: String,
}

/// Platform WiFi control
#[async_trait]
pub trait WiFiScanner: Send + Sync {
    /// List visible networks
    async fn scan(&self) -> Result<Vec<WiFiNetwork>>;

    /// Join a network; an empty password joins an open network
    async fn connect(&self, ssid: &str, password: &str) -> Result<()>;

    /// Leave the current network
    async fn disconnect(&self) -> Result<()>;

    /// The network the host is currently joined to, if any
    async fn current_network(&self) -> Result<Option<WiFiNetwork>>;
}

/// A normalized BLE advertisement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BleAdvertisement {
    /// Radio address (MAC on most platforms)
    pub address: String,
    pub local_name: String,
    pub rssi: i16,
    pub connectable: bool,
    /// Advertised service UUIDs, short ("fcd2") or full form
    pub service_uuids: Vec<String>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<String, Vec<u8>>,
    pub manufacturer_id: u16,
    pub manufacturer_data: Vec<u8>,
}

/// Receives every advertisement seen while a BLE scan is running
pub type AdvertisementCallback = Arc<dyn Fn(BleAdvertisement) + Send + Sync>;

/// Platform BLE radio
#[async_trait]
pub trait BleScanner: Send + Sync {
    /// Start scanning. Returns once the radio is scanning; advertisements are
    /// delivered to `callback` until `stop` is called.
    async fn start(&self, callback: AdvertisementCallback) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Optional BLE connection capability, used only to test connectability
#[async_trait]
pub trait BleConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}
