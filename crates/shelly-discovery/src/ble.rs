//! BLE discovery
//!
//! Filters advertisements from a platform [`BleScanner`] for Shelly devices
//! (vendor name prefix, vendor GATT service, or BTHome service data) and
//! turns them into device records, decoding BTHome telemetry when present.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shelly_core::{DiscoveredDevice, Generation, Protocol};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bthome::{parse_bthome_data, BtHomeData, BTHOME_SERVICE_UUID};
use crate::connectability::ConnectabilityCache;
use crate::discoverer::{
    cancel_after, forward, reap_finished, BackgroundTask, Discoverer, DEVICE_CHANNEL_CAPACITY,
};
use crate::error::{DiscoveryError, Result};
use crate::platform::{AdvertisementCallback, BleAdvertisement, BleConnector, BleScanner};

/// Local name prefix used by Shelly devices (matched case-insensitively)
pub const SHELLY_NAME_PREFIX: &str = "shelly";

/// GATT service exposed by Shelly Gen2+ devices for RPC over BLE
pub const SHELLY_SERVICE_UUID: &str = "5f6d4f53-5f52-5043-5f53-56435f49445f";

/// Capacity of the radio callback -> parser channel
const ADVERTISEMENT_CHANNEL_CAPACITY: usize = 256;

/// Bluetooth base UUID tail used to expand 16/32-bit UUIDs
const BLUETOOTH_BASE_TAIL: [u8; 8] = [0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb];

/// A device found over BLE, with the radio-level details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleDiscoveredDevice {
    pub device: DiscoveredDevice,
    pub local_name: String,
    pub rssi: i16,
    pub connectable: bool,
    pub bthome: Option<BtHomeData>,
}

/// Whether an advertisement comes from a Shelly device
pub fn is_shelly_device(advertisement: &BleAdvertisement, include_bthome: bool) -> bool {
    let name = advertisement.local_name.to_ascii_lowercase();
    if name.starts_with(SHELLY_NAME_PREFIX) {
        return true;
    }

    if advertisement
        .service_uuids
        .iter()
        .any(|u| uuid_matches(u, SHELLY_SERVICE_UUID))
    {
        return true;
    }

    include_bthome && bthome_service_data(advertisement).is_some()
}

/// Build a device record from an advertisement
///
/// Returns `None` when the advertisement has no address to identify it by.
pub fn parse_advertisement(advertisement: &BleAdvertisement) -> Option<BleDiscoveredDevice> {
    if advertisement.address.is_empty() {
        return None;
    }

    let mut device = DiscoveredDevice::new(advertisement.address.clone(), Protocol::Ble);
    device.mac_address = advertisement.address.clone();
    device.name = advertisement.local_name.clone();
    device.model = model_from_name(&advertisement.local_name);
    device.generation = Generation::Gen2;
    device.raw = serde_json::to_vec(advertisement).ok();

    let bthome = bthome_service_data(advertisement).and_then(parse_bthome_data);

    Some(BleDiscoveredDevice {
        device,
        local_name: advertisement.local_name.clone(),
        rssi: advertisement.rssi,
        connectable: advertisement.connectable,
        bthome,
    })
}

/// Second segment of a `PREFIX-MODEL-SUFFIX` local name
fn model_from_name(name: &str) -> String {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 3 {
        parts[1].to_string()
    } else {
        String::new()
    }
}

fn bthome_service_data(advertisement: &BleAdvertisement) -> Option<&[u8]> {
    advertisement
        .service_data
        .iter()
        .find(|(uuid, _)| uuid_matches(uuid, BTHOME_SERVICE_UUID))
        .map(|(_, data)| data.as_slice())
}

/// Compare UUIDs given in short ("fcd2", "0xFCD2") or full form
fn uuid_matches(candidate: &str, wanted: &str) -> bool {
    match (parse_uuid(candidate), parse_uuid(wanted)) {
        (Some(a), Some(b)) => a == b,
        _ => candidate.trim().eq_ignore_ascii_case(wanted.trim()),
    }
}

fn parse_uuid(value: &str) -> Option<Uuid> {
    let value = value.trim();
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    if hex.len() == 4 || hex.len() == 8 {
        let short = u32::from_str_radix(hex, 16).ok()?;
        return Some(Uuid::from_fields(short, 0x0000, 0x1000, &BLUETOOTH_BASE_TAIL));
    }
    Uuid::parse_str(value).ok()
}

/// Filter and parse one advertisement
///
/// Connectability comes from the cache or the advertisement flag; real
/// connection tests only run through [`BleDiscoverer::is_connectable`].
async fn process_advertisement(
    advertisement: BleAdvertisement,
    include_bthome: bool,
    cache: &ConnectabilityCache,
) -> Option<BleDiscoveredDevice> {
    if !is_shelly_device(&advertisement, include_bthome) {
        return None;
    }
    let mut found = parse_advertisement(&advertisement)?;
    found.connectable = cache.known_or_advertised(&advertisement).await;
    Some(found)
}

/// BLE discoverer
pub struct BleDiscoverer {
    scanner: Option<Arc<dyn BleScanner>>,
    connector: Option<Arc<dyn BleConnector>>,
    cache: Arc<ConnectabilityCache>,
    include_bthome: bool,
    continuous: RwLock<Option<BackgroundTask>>,
}

impl BleDiscoverer {
    /// Create a discoverer; `None` means BLE is unavailable on this host
    pub fn new(scanner: Option<Arc<dyn BleScanner>>) -> Self {
        Self {
            scanner,
            connector: None,
            cache: Arc::new(ConnectabilityCache::new()),
            include_bthome: true,
            continuous: RwLock::new(None),
        }
    }

    /// Test connectability with real connections through `connector`
    pub fn with_connector(mut self, connector: Arc<dyn BleConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share a connectability cache with other components
    pub fn with_cache(mut self, cache: Arc<ConnectabilityCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Also accept devices that only advertise BTHome service data
    pub fn with_bthome(mut self, include_bthome: bool) -> Self {
        self.include_bthome = include_bthome;
        self
    }

    pub fn cache(&self) -> &Arc<ConnectabilityCache> {
        &self.cache
    }

    pub async fn is_connectable(&self, advertisement: &BleAdvertisement) -> bool {
        self.cache
            .is_connectable(advertisement, self.connector.as_deref())
            .await
    }

    pub async fn clear_connectability_cache(&self) {
        self.cache.clear().await;
    }

    fn scanner(&self) -> Result<Arc<dyn BleScanner>> {
        self.scanner.clone().ok_or(DiscoveryError::BleNotSupported)
    }

    /// Discover devices with their BLE details until `timeout` elapses
    pub async fn discover_devices(&self, timeout: Duration) -> Result<Vec<BleDiscoveredDevice>> {
        let (cancel, _guard) = cancel_after(timeout);
        self.discover_devices_with_cancel(cancel).await
    }

    /// Discover devices with their BLE details until `cancel` fires
    pub async fn discover_devices_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<BleDiscoveredDevice>> {
        let scanner = self.scanner()?;

        let (tx, mut rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_CAPACITY);
        scanner.start(advertisement_sink(tx)).await?;
        info!("BLE scan started");

        let mut devices: HashMap<String, BleDiscoveredDevice> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                advertisement = rx.recv() => match advertisement {
                    Some(advertisement) => {
                        let found =
                            process_advertisement(advertisement, self.include_bthome, &self.cache)
                                .await;
                        if let Some(found) = found {
                            debug!(
                                id = %found.device.id,
                                name = %found.local_name,
                                rssi = found.rssi,
                                bthome = found.bthome.is_some(),
                                "BLE device found"
                            );
                            devices.insert(found.device.id.clone(), found);
                        }
                    }
                    None => break,
                },
            }
        }

        if let Err(e) = scanner.stop().await {
            warn!(error = %e, "Failed to stop BLE scan");
        }

        info!(count = devices.len(), "BLE discovery complete");
        Ok(devices.into_values().collect())
    }
}

/// Callback handed to the radio: queue advertisements, drop when full
fn advertisement_sink(tx: mpsc::Sender<BleAdvertisement>) -> AdvertisementCallback {
    Arc::new(move |advertisement| {
        if let Err(mpsc::error::TrySendError::Full(a)) = tx.try_send(advertisement) {
            trace!(address = %a.address, "Advertisement channel full, dropping");
        }
    })
}

#[async_trait]
impl Discoverer for BleDiscoverer {
    fn protocol(&self) -> Protocol {
        Protocol::Ble
    }

    async fn discover_with_cancel(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        let devices = self.discover_devices_with_cancel(cancel).await?;
        Ok(devices.into_iter().map(|d| d.device).collect())
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveredDevice>> {
        let scanner = self.scanner()?;

        // A task whose consumer went away has exited but left the scan running
        if reap_finished(&self.continuous).await {
            if let Err(e) = scanner.stop().await {
                warn!(error = %e, "Failed to stop BLE scan");
            }
        }
        if self.continuous.read().await.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let (adv_tx, mut adv_rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_CAPACITY);
        scanner.start(advertisement_sink(adv_tx)).await?;

        let (device_tx, device_rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);
        let cache = self.cache.clone();
        let include_bthome = self.include_bthome;

        let mut continuous = self.continuous.write().await;
        if continuous.is_some() {
            drop(continuous);
            let _ = scanner.stop().await;
            return Err(DiscoveryError::AlreadyRunning);
        }

        *continuous = Some(BackgroundTask::spawn(move |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = device_tx.closed() => break,
                    advertisement = adv_rx.recv() => match advertisement {
                        Some(advertisement) => {
                            let found =
                                process_advertisement(advertisement, include_bthome, &cache).await;
                            if let Some(found) = found {
                                forward(&device_tx, found.device);
                            }
                        }
                        None => break,
                    },
                }
            }
        }));

        info!("BLE continuous discovery started");
        Ok(device_rx)
    }

    async fn stop_discovery(&self) -> Result<()> {
        let task = self.continuous.write().await.take();
        if let Some(task) = task {
            task.shutdown().await;
            if let Some(scanner) = &self.scanner {
                scanner.stop().await?;
            }
            info!("BLE continuous discovery stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed set of advertisements as soon as scanning starts
    struct FakeScanner {
        advertisements: Vec<BleAdvertisement>,
        stops: AtomicUsize,
        callback: Mutex<Option<AdvertisementCallback>>,
    }

    impl FakeScanner {
        fn new(advertisements: Vec<BleAdvertisement>) -> Self {
            Self {
                advertisements,
                stops: AtomicUsize::new(0),
                callback: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl BleScanner for FakeScanner {
        async fn start(&self, callback: AdvertisementCallback) -> Result<()> {
            for advertisement in &self.advertisements {
                callback(advertisement.clone());
            }
            *self.callback.lock().unwrap() = Some(callback);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.callback.lock().unwrap().take();
            Ok(())
        }
    }

    fn named(address: &str, name: &str) -> BleAdvertisement {
        BleAdvertisement {
            address: address.to_string(),
            local_name: name.to_string(),
            rssi: -60,
            connectable: true,
            ..Default::default()
        }
    }

    fn bthome_only(address: &str, payload: &[u8]) -> BleAdvertisement {
        let mut service_data = HashMap::new();
        service_data.insert("0000fcd2-0000-1000-8000-00805f9b34fb".to_string(), payload.to_vec());
        BleAdvertisement {
            address: address.to_string(),
            local_name: "SBHT-003C".to_string(),
            service_data,
            ..Default::default()
        }
    }

    #[test]
    fn test_is_shelly_device() {
        assert!(is_shelly_device(&named("A", "ShellyPlus1-Plus1-A1B2"), false));
        assert!(is_shelly_device(&named("A", "SHELLY-x"), false));
        assert!(!is_shelly_device(&named("A", "Thermometer"), false));

        let mut by_service = named("A", "");
        by_service.service_uuids = vec![SHELLY_SERVICE_UUID.to_uppercase()];
        assert!(is_shelly_device(&by_service, false));

        let sensor = bthome_only("B", &[0x40, 0x01, 0x64]);
        assert!(is_shelly_device(&sensor, true));
        assert!(!is_shelly_device(&sensor, false));
    }

    #[test]
    fn test_uuid_short_and_full_forms() {
        assert!(uuid_matches("FCD2", "fcd2"));
        assert!(uuid_matches("0xfcd2", "fcd2"));
        assert!(uuid_matches("0000fcd2-0000-1000-8000-00805f9b34fb", "fcd2"));
        assert!(!uuid_matches("180f", "fcd2"));
    }

    #[test]
    fn test_parse_advertisement_model_and_bthome() {
        let mut advertisement = named("AA:BB:CC:DD:EE:FF", "ShellyPlusHT-PlusHT-E4B3");
        advertisement
            .service_data
            .insert("fcd2".to_string(), vec![0x40, 0x01, 0x64, 0x02, 0xE8, 0x03]);

        let found = parse_advertisement(&advertisement).unwrap();
        assert_eq!(found.device.id, "AA:BB:CC:DD:EE:FF");
        assert_eq!(found.device.mac_address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(found.device.model, "PlusHT");
        assert_eq!(found.device.generation, Generation::Gen2);
        assert_eq!(found.device.protocol, Protocol::Ble);
        assert!(found.device.address.is_none());

        let bthome = found.bthome.unwrap();
        assert_eq!(bthome.battery, Some(100));
        assert!((bthome.temperature.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_advertisement_requires_address() {
        assert!(parse_advertisement(&named("", "Shelly-X-Y")).is_none());
        assert_eq!(parse_advertisement(&named("A", "Shelly")).unwrap().device.model, "");
    }

    #[tokio::test]
    async fn test_nil_scanner_not_supported() {
        let discoverer = BleDiscoverer::new(None);
        let err = discoverer.discover(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::BleNotSupported));
        assert!(matches!(
            discoverer.start_discovery().await,
            Err(DiscoveryError::BleNotSupported)
        ));
    }

    #[tokio::test]
    async fn test_discover_filters_and_dedups() {
        let scanner = Arc::new(FakeScanner::new(vec![
            named("11:11:11:11:11:11", "ShellyPlus1-Plus1-0001"),
            named("11:11:11:11:11:11", "ShellyPlus1-Plus1-0001"),
            named("22:22:22:22:22:22", "SomeSpeaker"),
            bthome_only("33:33:33:33:33:33", &[0x40, 0x01, 0x32]),
        ]));
        let discoverer = BleDiscoverer::new(Some(scanner.clone() as Arc<dyn BleScanner>));

        let mut found = discoverer.discover_devices(Duration::from_millis(100)).await.unwrap();
        found.sort_by(|a, b| a.device.id.cmp(&b.device.id));

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].device.id, "11:11:11:11:11:11");
        assert_eq!(found[1].bthome.as_ref().unwrap().battery, Some(50));
        assert_eq!(scanner.stops.load(Ordering::SeqCst), 1);

        let plain = discoverer
            .with_bthome(false)
            .discover(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(plain.len(), 1);
    }

    #[tokio::test]
    async fn test_continuous_mode() {
        let scanner = Arc::new(FakeScanner::new(vec![named("AA", "Shelly-Mini-01")]));
        let discoverer = BleDiscoverer::new(Some(scanner.clone() as Arc<dyn BleScanner>));

        let mut rx = discoverer.start_discovery().await.unwrap();
        let device = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.model, "Mini");

        discoverer.stop().await.unwrap();
        assert_eq!(scanner.stops.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_none());
    }

    /// Connector whose connect either succeeds at once or never completes
    struct TestConnector {
        hang: bool,
        attempts: AtomicUsize,
    }

    impl TestConnector {
        fn new(hang: bool) -> Self {
            Self {
                hang,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BleConnector for TestConnector {
        async fn connect(&self, _address: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_discover_keeps_deadline_with_unresponsive_connector() {
        let scanner = Arc::new(FakeScanner::new(vec![
            named("11:11:11:11:11:11", "ShellyPlus1-Plus1-0001"),
            named("22:22:22:22:22:22", "ShellyPlus2-Plus2-0002"),
        ]));
        let connector = Arc::new(TestConnector::new(true));
        let discoverer = BleDiscoverer::new(Some(scanner as Arc<dyn BleScanner>))
            .with_connector(connector.clone());

        let start = std::time::Instant::now();
        let found = discoverer.discover_devices(Duration::from_millis(100)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|d| d.connectable));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);

        let mut rx = discoverer.start_discovery().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), discoverer.stop())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_discover_reports_tested_connectability() {
        let mut advertisement = named("AA:BB:CC:DD:EE:01", "ShellyPlus1-Plus1-0001");
        advertisement.connectable = false;
        let scanner = Arc::new(FakeScanner::new(vec![advertisement.clone()]));
        let discoverer = BleDiscoverer::new(Some(scanner as Arc<dyn BleScanner>))
            .with_connector(Arc::new(TestConnector::new(false)));

        let found = discoverer.discover_devices(Duration::from_millis(50)).await.unwrap();
        assert!(!found[0].connectable);

        assert!(discoverer.is_connectable(&advertisement).await);
        let found = discoverer.discover_devices(Duration::from_millis(50)).await.unwrap();
        assert!(found[0].connectable);
    }

    #[tokio::test]
    async fn test_restart_after_consumer_dropped() {
        let scanner = Arc::new(FakeScanner::new(vec![named("AA", "Shelly-Mini-01")]));
        let discoverer = BleDiscoverer::new(Some(scanner.clone() as Arc<dyn BleScanner>));

        drop(discoverer.start_discovery().await.unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        let mut rx = loop {
            match discoverer.start_discovery().await {
                Ok(rx) => break rx,
                Err(DiscoveryError::AlreadyRunning) => {
                    assert!(std::time::Instant::now() < deadline);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        // The abandoned scan was stopped before the new one started
        assert_eq!(scanner.stops.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_some());

        discoverer.stop().await.unwrap();
        assert_eq!(scanner.stops.load(Ordering::SeqCst), 2);
    }
}
