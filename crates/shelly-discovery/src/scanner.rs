//! Discovery scanner that combines all discovery methods

use futures_util::future::join_all;
use shelly_core::{DiscoveredDevice, Protocol, DEFAULT_HTTP_PORT};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::BleDiscoverer;
use crate::coiot::CoiotDiscoverer;
use crate::config::ScannerConfig;
use crate::connectability::ConnectabilityCache;
use crate::discoverer::{cancel_after, Discoverer};
use crate::error::{DiscoveryError, Result};
use crate::identify::{DeviceIdentifier, HttpIdentifier};
use crate::mdns::MdnsDiscoverer;
use crate::platform::{BleConnector, BleScanner, WiFiScanner};
use crate::probe::{identify_hosts, subnet_hosts};
use crate::wifi::WifiApDiscoverer;

/// Runs the enabled discoverers together and merges what they find
pub struct Scanner {
    config: ScannerConfig,
    discoverers: Vec<Arc<dyn Discoverer>>,
    identifier: Arc<dyn DeviceIdentifier>,
}

/// Platform capabilities and extra discoverers for a [`Scanner`]
pub struct ScannerBuilder {
    config: ScannerConfig,
    ble_scanner: Option<Arc<dyn BleScanner>>,
    ble_connector: Option<Arc<dyn BleConnector>>,
    connectability: Option<Arc<ConnectabilityCache>>,
    wifi_scanner: Option<Arc<dyn WiFiScanner>>,
    identifier: Option<Arc<dyn DeviceIdentifier>>,
    extra: Vec<Arc<dyn Discoverer>>,
}

impl ScannerBuilder {
    pub fn ble_scanner(mut self, scanner: Arc<dyn BleScanner>) -> Self {
        self.ble_scanner = Some(scanner);
        self
    }

    pub fn ble_connector(mut self, connector: Arc<dyn BleConnector>) -> Self {
        self.ble_connector = Some(connector);
        self
    }

    /// Share a connectability cache with other BLE users
    pub fn connectability_cache(mut self, cache: Arc<ConnectabilityCache>) -> Self {
        self.connectability = Some(cache);
        self
    }

    pub fn wifi_scanner(mut self, scanner: Arc<dyn WiFiScanner>) -> Self {
        self.wifi_scanner = Some(scanner);
        self
    }

    pub fn identifier(mut self, identifier: Arc<dyn DeviceIdentifier>) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Run an additional discoverer alongside the built-in ones
    pub fn discoverer(mut self, discoverer: Arc<dyn Discoverer>) -> Self {
        self.extra.push(discoverer);
        self
    }

    pub fn build(self) -> Scanner {
        let config = self.config;
        let identifier: Arc<dyn DeviceIdentifier> = match self.identifier {
            Some(identifier) => identifier,
            None => Arc::new(HttpIdentifier::new()),
        };

        let mut discoverers: Vec<Arc<dyn Discoverer>> = Vec::new();

        if config.enable_mdns {
            discoverers.push(Arc::new(MdnsDiscoverer::new(config.mdns_service.clone())));
        }

        if config.enable_coiot {
            discoverers.push(Arc::new(CoiotDiscoverer::new(config.coiot_group, config.coiot_port)));
        }

        if config.enable_ble {
            let mut ble = BleDiscoverer::new(self.ble_scanner).with_bthome(config.ble_include_bthome);
            if let Some(connector) = self.ble_connector {
                ble = ble.with_connector(connector);
            }
            if let Some(cache) = self.connectability {
                ble = ble.with_cache(cache);
            }
            discoverers.push(Arc::new(ble));
        }

        if config.enable_wifi_ap {
            let wifi = WifiApDiscoverer::new(self.wifi_scanner)
                .with_probing(config.probe_wifi_devices)
                .with_settle_delay(config.wifi_probe_settle())
                .with_probe_timeout(config.identify_timeout())
                .with_identifier(identifier.clone());
            discoverers.push(Arc::new(wifi));
        }

        discoverers.extend(self.extra);

        Scanner {
            config,
            discoverers,
            identifier,
        }
    }
}

impl Scanner {
    /// Create a scanner with the given configuration and no platform radios
    pub fn new(config: ScannerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ScannerConfig) -> ScannerBuilder {
        ScannerBuilder {
            config,
            ble_scanner: None,
            ble_connector: None,
            connectability: None,
            wifi_scanner: None,
            identifier: None,
            extra: Vec::new(),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Protocols of the discoverers this scanner runs
    pub fn protocols(&self) -> Vec<Protocol> {
        self.discoverers.iter().map(|d| d.protocol()).collect()
    }

    /// Run every discoverer for `timeout` and merge the results
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        let (cancel, _guard) = cancel_after(timeout);
        self.scan_with_cancel(cancel).await
    }

    /// Run every discoverer until `cancel` fires and merge the results
    ///
    /// A failing discoverer is logged and skipped; the others still count.
    pub async fn scan_with_cancel(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        info!(discoverers = self.discoverers.len(), "Starting discovery scan");

        let results = join_all(self.discoverers.iter().map(|discoverer| {
            let cancel = cancel.clone();
            async move {
                let protocol = discoverer.protocol();
                (protocol, discoverer.discover_with_cancel(cancel).await)
            }
        }))
        .await;

        let mut found = Vec::new();
        for (protocol, result) in results {
            match result {
                Ok(devices) => {
                    debug!(protocol = %protocol, count = devices.len(), "Discoverer finished");
                    found.extend(devices);
                }
                Err(e @ (DiscoveryError::BleNotSupported | DiscoveryError::WifiNotSupported)) => {
                    debug!(protocol = %protocol, error = %e, "Discoverer unavailable");
                }
                Err(e) => {
                    warn!(protocol = %protocol, error = %e, "Discoverer failed");
                }
            }
        }

        let total = found.len();
        let devices = deduplicate(found);
        info!(found = total, unique = devices.len(), "Discovery scan complete");
        Ok(devices)
    }

    /// Identify the given addresses over HTTP
    pub async fn scan_addresses(&self, addresses: &[IpAddr], timeout: Duration) -> Vec<DiscoveredDevice> {
        let devices = identify_hosts(self.identifier.clone(), addresses, DEFAULT_HTTP_PORT, timeout).await;
        deduplicate(devices)
    }

    /// Identify every host address of `subnet/prefix_len` over HTTP
    pub async fn scan_subnet(
        &self,
        subnet: Ipv4Addr,
        prefix_len: u8,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        let hosts: Vec<IpAddr> = subnet_hosts(subnet, prefix_len)?
            .into_iter()
            .map(IpAddr::V4)
            .collect();
        info!(subnet = %subnet, prefix = prefix_len, hosts = hosts.len(), "Scanning subnet");
        Ok(self.scan_addresses(&hosts, timeout).await)
    }

    /// Stop every discoverer
    ///
    /// All discoverers are stopped even if some fail; the first error is
    /// returned.
    pub async fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for discoverer in &self.discoverers {
            if let Err(e) = discoverer.stop().await {
                warn!(protocol = %discoverer.protocol(), error = %e, "Failed to stop discoverer");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Collapse records of the same device
///
/// Records are keyed by ID, else MAC, else address. For a shared key the
/// record with the later `last_seen` is kept whole; on a tie the first one
/// stays. Records with no key are dropped. Output is ordered by key.
pub fn deduplicate(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut merged: BTreeMap<String, DiscoveredDevice> = BTreeMap::new();
    for device in devices {
        let Some(key) = device.merge_key() else {
            continue;
        };
        match merged.get(&key) {
            Some(existing) if device.last_seen <= existing.last_seen => {}
            _ => {
                merged.insert(key, device);
            }
        }
    }
    merged.into_values().collect()
}
