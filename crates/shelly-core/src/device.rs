//! Device types produced by every discovery protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Default HTTP port exposed by Shelly devices
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// How a device was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Multicast DNS service advertisement
    Mdns,
    /// CoAP/CoIoT multicast status broadcast
    Coiot,
    /// Bluetooth Low Energy advertisement
    Ble,
    /// Access point broadcast by an unprovisioned device
    WifiAp,
    /// Explicitly probed address
    Manual,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mdns => "mdns",
            Protocol::Coiot => "coiot",
            Protocol::Ble => "ble",
            Protocol::WifiAp => "wifi_ap",
            Protocol::Manual => "manual",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware/firmware generation of a device
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    #[default]
    Unknown,
    Gen1,
    Gen2,
    Gen3,
    Gen4,
}

impl Generation {
    /// Map a numeric generation as reported by a device
    pub fn from_number(n: u64) -> Self {
        match n {
            1 => Self::Gen1,
            2 => Self::Gen2,
            3 => Self::Gen3,
            4 => Self::Gen4,
            _ => Self::Unknown,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Gen1 => 1,
            Self::Gen2 => 2,
            Self::Gen3 => 3,
            Self::Gen4 => 4,
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            other => write!(f, "gen{}", other.number()),
        }
    }
}

/// A device observed by one of the discovery protocols
///
/// String fields are empty when the producing protocol could not determine
/// them. Records are replaced wholesale by newer observations, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Stable device identifier (derivation depends on the protocol)
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Model or device type code (e.g. "SHSW-1", "SNSW-001X16EU")
    #[serde(default)]
    pub model: String,
    /// MAC address, upper-case hex (with or without separators)
    #[serde(default)]
    pub mac_address: String,
    /// Firmware version string
    #[serde(default)]
    pub firmware: String,
    /// How the device was discovered
    pub protocol: Protocol,
    /// IP address (absent for unprovisioned BLE/WiFi devices)
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// HTTP port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub generation: Generation,
    /// Whether the device requires authentication
    #[serde(default)]
    pub auth_required: bool,
    /// When this observation was made
    pub last_seen: DateTime<Utc>,
    /// Raw protocol payload kept for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

impl DiscoveredDevice {
    /// Create a device record with only an ID and protocol set
    pub fn new(id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            model: String::new(),
            mac_address: String::new(),
            firmware: String::new(),
            protocol,
            address: None,
            port: 0,
            generation: Generation::Unknown,
            auth_required: false,
            last_seen: Utc::now(),
            raw: None,
        }
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Key used to decide that two observations are the same device:
    /// ID, then MAC address, then IP address
    pub fn merge_key(&self) -> Option<String> {
        if !self.id.is_empty() {
            return Some(self.id.clone());
        }
        if !self.mac_address.is_empty() {
            return Some(self.mac_address.clone());
        }
        self.address.map(|ip| ip.to_string())
    }

    /// Address and port as a socket address, if an address is known
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let port = if self.port == 0 { DEFAULT_HTTP_PORT } else { self.port };
        self.address.map(|ip| SocketAddr::new(ip, port))
    }
}
