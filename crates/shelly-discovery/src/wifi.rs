//! WiFi access-point discovery
//!
//! Unprovisioned devices run their own open access point named after the
//! model and device id (`shellyplus1pm-AABBCC`). A scan finds them by SSID.
//! With probing enabled each match is joined briefly and identified at the
//! AP-mode address, after which the host is returned to its original network.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use shelly_core::{DiscoveredDevice, Generation, Protocol};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::discoverer::{
    forward, reap_finished, BackgroundTask, Discoverer, DEVICE_CHANNEL_CAPACITY,
};
use crate::error::{DiscoveryError, Result};
use crate::identify::{DeviceIdentifier, DeviceInfo, HttpIdentifier};
use crate::platform::{WiFiNetwork, WiFiScanner};

/// Address of a device in AP mode
pub const AP_MODE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 33, 1);
pub const AP_MODE_PORT: u16 = 80;

/// Time to let the link come up after joining a device AP
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between scans in continuous mode
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

const VENDOR_PREFIX: &str = "shelly";

static SSID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^shelly[a-z0-9]+[-_]?[0-9a-f]+$").expect("SSID pattern is valid")
});

/// Whether `ssid` looks like a device access point
pub fn is_shelly_ap(ssid: &str) -> bool {
    SSID_PATTERN.is_match(ssid)
}

/// Split a device AP SSID into `(device type, device id)`
///
/// With two or more `-`/`_` separated segments after the prefix, the first
/// is the type and the last is the id. A single segment is split at the
/// longest trailing run of hex digits. SSIDs with extra separators only
/// keep the outer segments.
pub fn parse_shelly_ssid(ssid: &str) -> Option<(String, String)> {
    let prefix = ssid.get(..VENDOR_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(VENDOR_PREFIX) {
        return None;
    }
    let rest = &ssid[VENDOR_PREFIX.len()..];

    let segments: Vec<&str> = rest
        .split(['-', '_'])
        .filter(|s| !s.is_empty())
        .collect();

    match segments.as_slice() {
        [] => None,
        [single] => {
            let hex_len = single
                .bytes()
                .rev()
                .take_while(u8::is_ascii_hexdigit)
                .count();
            if hex_len == 0 {
                return None;
            }
            let split = single.len() - hex_len;
            Some((single[..split].to_string(), single[split..].to_uppercase()))
        }
        [first, .., last] => Some((first.to_string(), last.to_uppercase())),
    }
}

/// Generation implied by a model token
pub fn infer_generation_from_model(model: &str) -> Generation {
    let model = model.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| model.contains(n));

    if has(&["g4", "gen4"]) {
        Generation::Gen4
    } else if has(&["g3", "gen3"]) {
        Generation::Gen3
    } else if has(&["plus", "pro", "g2", "gen2"]) {
        Generation::Gen2
    } else {
        Generation::Gen1
    }
}

/// Fill the derived device fields of a scan result
pub fn classify_network(network: &mut WiFiNetwork) {
    network.is_shelly = is_shelly_ap(&network.ssid);
    if !network.is_shelly {
        return;
    }
    if let Some((device_type, device_id)) = parse_shelly_ssid(&network.ssid) {
        network.device_type = device_type;
        network.device_id = device_id;
    }
}

/// `AABBCCDDEEFF` -> `AA:BB:CC:DD:EE:FF`; anything else is not a MAC
fn format_mac(id: &str) -> Option<String> {
    if id.len() != 12 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let pairs: Vec<&str> = (0..12).step_by(2).map(|i| &id[i..i + 2]).collect();
    Some(pairs.join(":").to_uppercase())
}

/// Build the unprobed record for a classified network
pub fn device_from_network(network: &WiFiNetwork) -> Option<DiscoveredDevice> {
    if !network.is_shelly || network.ssid.is_empty() {
        return None;
    }
    let mut device = DiscoveredDevice::new(network.ssid.to_lowercase(), Protocol::WifiAp);
    device.name = network.ssid.clone();
    device.model = network.device_type.clone();
    device.generation = infer_generation_from_model(&network.device_type);
    if let Some(mac) = format_mac(&network.device_id) {
        device.mac_address = mac;
    }
    device.raw = serde_json::to_vec(network).ok();
    Some(device)
}

pub struct WifiApDiscoverer {
    scanner: Option<Arc<dyn WiFiScanner>>,
    identifier: Arc<dyn DeviceIdentifier>,
    probe_devices: bool,
    settle_delay: Duration,
    probe_timeout: Duration,
    continuous: RwLock<Option<BackgroundTask>>,
}

impl WifiApDiscoverer {
    pub fn new(scanner: Option<Arc<dyn WiFiScanner>>) -> Self {
        Self {
            scanner,
            identifier: Arc::new(HttpIdentifier::new()),
            probe_devices: false,
            settle_delay: DEFAULT_SETTLE_DELAY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            continuous: RwLock::new(None),
        }
    }

    /// Join each device AP during one-shot discovery to identify it
    ///
    /// The host leaves its current network while a probe runs.
    pub fn with_probing(mut self, probe_devices: bool) -> Self {
        self.probe_devices = probe_devices;
        self
    }

    pub fn with_identifier(mut self, identifier: Arc<dyn DeviceIdentifier>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn probes_devices(&self) -> bool {
        self.probe_devices
    }

    fn scanner(&self) -> Result<Arc<dyn WiFiScanner>> {
        self.scanner.clone().ok_or(DiscoveryError::WifiNotSupported)
    }

    /// Join the device AP, identify the device and rejoin the original network
    ///
    /// Rejoining is attempted whatever the probe outcome. A failed rejoin is
    /// logged, not returned.
    pub async fn probe_device(
        &self,
        network: &WiFiNetwork,
        device: &mut DiscoveredDevice,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let scanner = self.scanner()?;

        let original = match scanner.current_network().await {
            Ok(current) => current,
            Err(e) => {
                debug!(error = %e, "Could not read current network");
                None
            }
        };

        info!(ssid = %network.ssid, "Probing device access point");
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(DiscoveryError::ConnectTimeout),
            r = self.join_and_identify(scanner.as_ref(), &network.ssid) => r,
        };

        restore_network(scanner.as_ref(), original.as_ref()).await;

        let info = outcome?;
        info.apply_to(device);
        device.address = Some(IpAddr::V4(AP_MODE_IP));
        device.port = AP_MODE_PORT;
        debug!(id = %device.id, model = %device.model, "Device access point identified");
        Ok(())
    }

    async fn join_and_identify(&self, scanner: &dyn WiFiScanner, ssid: &str) -> Result<DeviceInfo> {
        scanner.connect(ssid, "").await?;
        tokio::time::sleep(self.settle_delay).await;
        self.identifier
            .identify(IpAddr::V4(AP_MODE_IP), AP_MODE_PORT, self.probe_timeout)
            .await
    }
}

/// Return the host to `original`, or just leave the device AP
///
/// An empty password lets the platform reuse its saved credentials.
async fn restore_network(scanner: &dyn WiFiScanner, original: Option<&WiFiNetwork>) {
    let result = match original {
        Some(network) if !network.ssid.is_empty() => scanner.connect(&network.ssid, "").await,
        _ => scanner.disconnect().await,
    };
    if let Err(e) = result {
        warn!(
            original = original.map(|n| n.ssid.as_str()).unwrap_or(""),
            error = %e,
            "Failed to restore original WiFi network"
        );
    }
}

/// Classified device records for a scan
fn shelly_networks(networks: Vec<WiFiNetwork>) -> Vec<(WiFiNetwork, DiscoveredDevice)> {
    networks
        .into_iter()
        .filter_map(|mut network| {
            classify_network(&mut network);
            match device_from_network(&network) {
                Some(device) => Some((network, device)),
                None => {
                    trace!(ssid = %network.ssid, "Ignoring network");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl Discoverer for WifiApDiscoverer {
    fn protocol(&self) -> Protocol {
        Protocol::WifiAp
    }

    async fn discover_with_cancel(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        let scanner = self.scanner()?;

        info!(probe = self.probe_devices, "WiFi AP discovery started");
        let networks = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            r = scanner.scan() => r?,
        };

        let mut devices: HashMap<String, DiscoveredDevice> = HashMap::new();
        for (network, mut device) in shelly_networks(networks) {
            if self.probe_devices && !cancel.is_cancelled() {
                if let Err(e) = self.probe_device(&network, &mut device, &cancel).await {
                    warn!(ssid = %network.ssid, error = %e, "Device probe failed");
                }
            }
            debug!(id = %device.id, model = %device.model, signal = network.signal, "WiFi AP device found");
            devices.insert(device.id.clone(), device);
        }

        info!(count = devices.len(), "WiFi AP discovery complete");
        Ok(devices.into_values().collect())
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveredDevice>> {
        let scanner = self.scanner()?;

        reap_finished(&self.continuous).await;
        let mut continuous = self.continuous.write().await;
        if continuous.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let (device_tx, device_rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);
        *continuous = Some(BackgroundTask::spawn(move |cancel| async move {
            let mut ticker = tokio::time::interval(RESCAN_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = device_tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let networks = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = scanner.scan() => r,
                };
                match networks {
                    Ok(networks) => {
                        for (_, device) in shelly_networks(networks) {
                            forward(&device_tx, device);
                        }
                    }
                    Err(e) => debug!(error = %e, "WiFi scan failed, retrying next interval"),
                }
            }
        }));

        info!("WiFi AP continuous discovery started");
        Ok(device_rx)
    }

    async fn stop_discovery(&self) -> Result<()> {
        let task = self.continuous.write().await.take();
        if let Some(task) = task {
            task.shutdown().await;
            info!("WiFi AP continuous discovery stopped");
        }
        Ok(())
    }
}
