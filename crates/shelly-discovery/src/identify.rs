//! Device identification over HTTP
//!
//! Given an address, ask the device who it is: Gen2+ devices answer
//! `/rpc/Shelly.GetDeviceInfo`, Gen1 devices answer `/shelly`. Used by the
//! WiFi AP probe and by address-range scanning.

use async_trait::async_trait;
use serde::Deserialize;
use shelly_core::{DiscoveredDevice, Generation, Protocol};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{DiscoveryError, Result};

const GEN2_INFO_PATH: &str = "/rpc/Shelly.GetDeviceInfo";
const GEN1_INFO_PATH: &str = "/shelly";

/// What a device reports about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub mac: String,
    pub model: String,
    pub name: String,
    pub firmware: String,
    pub generation: Generation,
    pub auth_required: bool,
}

impl DeviceInfo {
    /// Overwrite the fields of `device` that this info knows
    pub fn apply_to(&self, device: &mut DiscoveredDevice) {
        if !self.id.is_empty() {
            device.id = self.id.clone();
        }
        if !self.mac.is_empty() {
            device.mac_address = self.mac.clone();
        }
        if !self.model.is_empty() {
            device.model = self.model.clone();
        }
        if !self.name.is_empty() {
            device.name = self.name.clone();
        }
        if !self.firmware.is_empty() {
            device.firmware = self.firmware.clone();
        }
        if self.generation != Generation::Unknown {
            device.generation = self.generation;
        }
        device.auth_required = self.auth_required;
    }

    /// Build a record for a device identified at `address:port`
    ///
    /// Returns `None` when neither an ID nor a MAC was reported.
    pub fn into_device(self, address: IpAddr, port: u16, protocol: Protocol) -> Option<DiscoveredDevice> {
        let id = if self.id.is_empty() { self.mac.clone() } else { self.id.clone() };
        if id.is_empty() {
            return None;
        }
        let mut device = DiscoveredDevice::new(id, protocol);
        self.apply_to(&mut device);
        device.address = Some(address);
        device.port = port;
        Some(device)
    }
}

/// Identifies the device listening at an address
#[async_trait]
pub trait DeviceIdentifier: Send + Sync {
    async fn identify(&self, address: IpAddr, port: u16, timeout: Duration) -> Result<DeviceInfo>;
}

#[derive(Deserialize)]
struct Gen2InfoRsp {
    #[serde(default)]
    id: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ver: String,
    #[serde(default)]
    gen: u64,
    #[serde(default)]
    auth_en: bool,
}

#[derive(Deserialize)]
struct Gen1InfoRsp {
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    auth: bool,
    #[serde(default)]
    fw: String,
}

/// Parse a `Shelly.GetDeviceInfo` response
pub fn parse_gen2_info(body: &[u8]) -> Option<DeviceInfo> {
    let rsp: Gen2InfoRsp = serde_json::from_slice(body).ok()?;
    if rsp.id.is_empty() && rsp.mac.is_empty() {
        return None;
    }
    let generation = match Generation::from_number(rsp.gen) {
        Generation::Unknown | Generation::Gen1 => Generation::Gen2,
        known => known,
    };
    Some(DeviceInfo {
        id: rsp.id,
        mac: rsp.mac,
        model: rsp.model,
        name: rsp.name.unwrap_or_default(),
        firmware: rsp.ver,
        generation,
        auth_required: rsp.auth_en,
    })
}

/// Parse a Gen1 `/shelly` response
pub fn parse_gen1_info(body: &[u8]) -> Option<DeviceInfo> {
    let rsp: Gen1InfoRsp = serde_json::from_slice(body).ok()?;
    if rsp.device_type.is_empty() && rsp.mac.is_empty() {
        return None;
    }
    Some(DeviceInfo {
        id: rsp.mac.clone(),
        mac: rsp.mac,
        model: rsp.device_type,
        name: String::new(),
        firmware: rsp.fw,
        generation: Generation::Gen1,
        auth_required: rsp.auth,
    })
}

/// [`DeviceIdentifier`] that talks to the device's HTTP API
#[derive(Debug, Clone, Default)]
pub struct HttpIdentifier {
    client: reqwest::Client,
}

impl HttpIdentifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl DeviceIdentifier for HttpIdentifier {
    async fn identify(&self, address: IpAddr, port: u16, timeout: Duration) -> Result<DeviceInfo> {
        let target = SocketAddr::new(address, port);

        let gen2_url = format!("http://{}{}", target, GEN2_INFO_PATH);
        match self.fetch(&gen2_url, timeout).await {
            Ok(body) => {
                if let Some(info) = parse_gen2_info(&body) {
                    debug!(target = %target, id = %info.id, "Identified Gen2+ device");
                    return Ok(info);
                }
            }
            Err(e) => trace!(target = %target, error = %e, "Gen2 info request failed"),
        }

        let gen1_url = format!("http://{}{}", target, GEN1_INFO_PATH);
        let body = self.fetch(&gen1_url, timeout).await?;
        let info = parse_gen1_info(&body)
            .ok_or_else(|| DiscoveryError::Identify(format!("no Shelly API at {}", target)))?;
        debug!(target = %target, model = %info.model, "Identified Gen1 device");
        Ok(info)
    }
}
