//! Shelly Discovery - Local network discovery for Shelly devices
//!
//! This crate provides multiple discovery methods:
//! - mDNS queries for the `_shelly._tcp` service
//! - CoIoT (CoAP) multicast status broadcasts from Gen1 devices
//! - BLE advertisements, including BTHome v2 sensor data
//! - WiFi access points of unprovisioned devices
//! - HTTP identification of address ranges
//!
//! [`Scanner`] runs the enabled methods together and deduplicates the
//! results. BLE and WiFi radios are reached through the traits in
//! [`platform`]; this crate ships no OS adapters for them.

pub mod ble;
pub mod bthome;
pub mod coiot;
pub mod config;
pub mod connectability;
pub mod discoverer;
pub mod error;
pub mod identify;
pub mod mdns;
pub mod platform;
pub mod probe;
pub mod scanner;
pub mod udp;
pub mod wifi;

pub use ble::{BleDiscoveredDevice, BleDiscoverer};
pub use bthome::{parse_bthome_data, BtHomeData};
pub use coiot::CoiotDiscoverer;
pub use config::{load_config, ScannerConfig};
pub use connectability::ConnectabilityCache;
pub use discoverer::Discoverer;
pub use error::{DiscoveryError, Result};
pub use identify::{DeviceIdentifier, DeviceInfo, HttpIdentifier};
pub use mdns::MdnsDiscoverer;
pub use platform::{
    AdvertisementCallback, BleAdvertisement, BleConnector, BleScanner, WiFiNetwork, WiFiScanner,
};
pub use scanner::{deduplicate, Scanner, ScannerBuilder};
pub use shelly_core::{DiscoveredDevice, Generation, Protocol};
pub use wifi::WifiApDiscoverer;
