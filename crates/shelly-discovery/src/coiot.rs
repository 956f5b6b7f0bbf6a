//! CoIoT discovery for Gen1 devices
//!
//! Gen1 devices periodically multicast CoAP status messages to
//! `224.0.1.187:5683`. This module decodes the CoAP framing and pulls a
//! device identity out of the payload (JSON when possible, otherwise a
//! MAC-shaped substring), with the CoIoT device-id option as a last resort.

use async_trait::async_trait;
use serde::Deserialize;
use shelly_core::{DiscoveredDevice, Generation, Protocol, DEFAULT_HTTP_PORT};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::discoverer::{
    forward, reap_finished, BackgroundTask, Discoverer, DEVICE_CHANNEL_CAPACITY,
};
use crate::error::{DiscoveryError, Result};
use crate::udp::{self, DATAGRAM_CHANNEL_CAPACITY};

/// CoIoT multicast group
pub const COIOT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

/// CoAP port
pub const COIOT_PORT: u16 = 5683;

/// CoIoT option carrying `"<type>#<id>#<version>"`
pub const OPTION_GLOBAL_DEVID: u16 = 3332;

const PAYLOAD_MARKER: u8 = 0xFF;

/// A CoAP option with its absolute option number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A decoded CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub version: u8,
    pub message_type: u8,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.value.as_slice())
    }
}

/// Decode CoAP framing
///
/// Returns `None` for a wrong version, a packet shorter than its header and
/// token, or a reserved (15) delta/length nibble.
pub fn parse_coap(data: &[u8]) -> Option<CoapMessage> {
    if data.len() < 4 {
        return None;
    }

    let version = data[0] >> 6;
    let message_type = (data[0] >> 4) & 0x03;
    let token_len = (data[0] & 0x0F) as usize;
    if version != 1 || data.len() < 4 + token_len {
        return None;
    }

    let code = data[1];
    let message_id = u16::from_be_bytes([data[2], data[3]]);
    let token = data[4..4 + token_len].to_vec();

    let mut options = Vec::new();
    let mut number: u16 = 0;
    let mut pos = 4 + token_len;
    let mut payload = Vec::new();

    while pos < data.len() {
        let byte = data[pos];
        if byte == PAYLOAD_MARKER {
            payload = data[pos + 1..].to_vec();
            break;
        }
        pos += 1;

        let (delta, next) = read_extended(data, pos, byte >> 4)?;
        pos = next;
        let (length, next) = read_extended(data, pos, byte & 0x0F)?;
        pos = next;

        number = number.checked_add(delta)?;
        let end = pos.checked_add(length as usize)?;
        if end > data.len() {
            break;
        }
        options.push(CoapOption {
            number,
            value: data[pos..end].to_vec(),
        });
        pos = end;
    }

    Some(CoapMessage {
        version,
        message_type,
        code,
        message_id,
        token,
        options,
        payload,
    })
}

/// Resolve a 4-bit delta/length nibble, reading 13/14 extensions
fn read_extended(data: &[u8], pos: usize, nibble: u8) -> Option<(u16, usize)> {
    match nibble {
        0..=12 => Some((nibble as u16, pos)),
        13 => {
            let ext = *data.get(pos)?;
            Some((ext as u16 + 13, pos + 1))
        }
        14 => {
            let ext = data.get(pos..pos + 2)?;
            let value = u16::from_be_bytes([ext[0], ext[1]]).checked_add(269)?;
            Some((value, pos + 2))
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    id: Option<String>,
    mac: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    fw_ver: Option<String>,
    settings: Option<PayloadSettings>,
}

#[derive(Debug, Deserialize)]
struct PayloadSettings {
    device: Option<PayloadDevice>,
}

#[derive(Debug, Deserialize)]
struct PayloadDevice {
    name: Option<String>,
}

/// Decode a CoIoT datagram into a Gen1 device
pub fn parse_packet(data: &[u8], source: SocketAddr) -> Option<DiscoveredDevice> {
    let message = parse_coap(data)?;

    let mut device = DiscoveredDevice::new(String::new(), Protocol::Coiot);

    match serde_json::from_slice::<StatusPayload>(&message.payload) {
        Ok(status) => {
            let mac = status.mac.unwrap_or_default();
            device.id = status
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| mac.replace(':', ""));
            device.mac_address = mac;
            device.model = status.device_type.unwrap_or_default();
            device.firmware = status.fw_ver.unwrap_or_default();
            device.name = status
                .settings
                .and_then(|s| s.device)
                .and_then(|d| d.name)
                .unwrap_or_default();
        }
        Err(_) => {
            let text = String::from_utf8_lossy(&message.payload);
            if let Some(mac) = find_mac(&text) {
                device.id = mac.replace(':', "");
                device.mac_address = mac.to_string();
            }
        }
    }

    if device.id.is_empty() {
        if let Some((device_type, id)) = message.option(OPTION_GLOBAL_DEVID).and_then(parse_global_devid) {
            device.id = id;
            if device.model.is_empty() {
                device.model = device_type;
            }
        }
    }

    if device.id.is_empty() {
        return None;
    }

    device.generation = Generation::Gen1;
    device.address = Some(source.ip());
    device.port = DEFAULT_HTTP_PORT;
    device.raw = Some(message.payload);
    Some(device)
}

/// Split the CoIoT device-id option `"<type>#<id>#<version>"`
fn parse_global_devid(value: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(value).ok()?;
    let mut parts = text.split('#');
    let device_type = parts.next()?.to_string();
    let id = parts.next()?.to_string();
    if id.is_empty() {
        return None;
    }
    Some((device_type, id))
}

/// Find the first `XX:XX:XX:XX:XX:XX` substring
fn find_mac(text: &str) -> Option<&str> {
    const MAC_LEN: usize = 17;
    let bytes = text.as_bytes();
    if bytes.len() < MAC_LEN {
        return None;
    }
    (0..=bytes.len() - MAC_LEN)
        .find(|&start| is_mac(&bytes[start..start + MAC_LEN]))
        .map(|start| &text[start..start + MAC_LEN])
}

fn is_mac(candidate: &[u8]) -> bool {
    candidate.iter().enumerate().all(|(i, &b)| {
        if i % 3 == 2 {
            b == b':'
        } else {
            b.is_ascii_hexdigit()
        }
    })
}

/// CoIoT discoverer
pub struct CoiotDiscoverer {
    group: Ipv4Addr,
    port: u16,
    continuous: RwLock<Option<BackgroundTask>>,
}

impl Default for CoiotDiscoverer {
    fn default() -> Self {
        Self::new(COIOT_GROUP, COIOT_PORT)
    }
}

impl CoiotDiscoverer {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            continuous: RwLock::new(None),
        }
    }

    async fn open_socket(&self) -> Result<Arc<UdpSocket>> {
        let socket = udp::bind_multicast(self.group, self.port).await?;
        Ok(Arc::new(socket))
    }
}

#[async_trait]
impl Discoverer for CoiotDiscoverer {
    fn protocol(&self) -> Protocol {
        Protocol::Coiot
    }

    async fn discover_with_cancel(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        let socket = self.open_socket().await?;
        info!(group = %self.group, port = self.port, "Listening for CoIoT broadcasts");

        let (tx, mut rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let reader_cancel = cancel.child_token();
        let reader = udp::spawn_reader(socket, tx, reader_cancel.clone());

        let mut devices: HashMap<String, DiscoveredDevice> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = rx.recv() => match datagram {
                    Some(datagram) => match parse_packet(&datagram.data, datagram.source) {
                        Some(device) => {
                            debug!(id = %device.id, model = %device.model, "CoIoT device found");
                            devices.insert(device.id.clone(), device);
                        }
                        None => trace!(source = %datagram.source, "Ignoring non-CoIoT datagram"),
                    },
                    None => break,
                },
            }
        }

        reader_cancel.cancel();
        let _ = reader.await;

        info!(count = devices.len(), "CoIoT discovery complete");
        Ok(devices.into_values().collect())
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveredDevice>> {
        reap_finished(&self.continuous).await;
        if self.continuous.read().await.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let socket = self.open_socket().await?;
        let (device_tx, device_rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);

        let mut continuous = self.continuous.write().await;
        if continuous.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        *continuous = Some(BackgroundTask::spawn(move |cancel| async move {
            let (tx, mut rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
            let reader_cancel = cancel.child_token();
            let reader = udp::spawn_reader(socket, tx, reader_cancel.clone());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = device_tx.closed() => break,
                    datagram = rx.recv() => match datagram {
                        Some(datagram) => {
                            if let Some(device) = parse_packet(&datagram.data, datagram.source) {
                                forward(&device_tx, device);
                            }
                        }
                        None => break,
                    },
                }
            }

            reader_cancel.cancel();
            let _ = reader.await;
        }));

        info!(group = %self.group, port = self.port, "CoIoT continuous discovery started");
        Ok(device_rx)
    }

    async fn stop_discovery(&self) -> Result<()> {
        let task = self.continuous.write().await.take();
        if let Some(task) = task {
            task.shutdown().await;
            info!("CoIoT continuous discovery stopped");
        }
        Ok(())
    }
}
