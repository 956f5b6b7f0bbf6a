//! Cache of whether BLE devices accept connections
//!
//! Connectability of an address is a slowly-changing fact, so results of
//! real connection attempts are cached per address. The cache is a plain
//! object: share it with `Arc` between discoverers that should agree, and
//! call `clear` to force retesting.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::platform::{BleAdvertisement, BleConnector};

/// Upper bound on a single connectability probe
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct ConnectabilityCache {
    entries: RwLock<HashMap<String, bool>>,
}

impl ConnectabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the advertising device accepts connections
    ///
    /// A cached result wins. Otherwise, with a connector, a real
    /// connect/disconnect decides and the result is cached (a failed or
    /// timed-out connect means not connectable). Without a connector the
    /// advertisement's own flag is returned and nothing is cached.
    pub async fn is_connectable(
        &self,
        advertisement: &BleAdvertisement,
        connector: Option<&dyn BleConnector>,
    ) -> bool {
        let key = normalize(&advertisement.address);
        if let Some(&cached) = self.entries.read().await.get(&key) {
            return cached;
        }

        let Some(connector) = connector else {
            return advertisement.connectable;
        };

        let connectable = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            connector.connect(&advertisement.address),
        )
        .await
        {
            Ok(Ok(())) => {
                if let Err(e) = connector.disconnect().await {
                    debug!(address = %advertisement.address, error = %e, "BLE disconnect failed");
                }
                true
            }
            Ok(Err(e)) => {
                debug!(address = %advertisement.address, error = %e, "BLE connect failed");
                false
            }
            Err(_) => {
                debug!(address = %advertisement.address, "BLE connect timed out");
                false
            }
        };

        self.entries.write().await.insert(key, connectable);
        connectable
    }

    /// Cached result, else the advertisement's own flag
    ///
    /// Never connects, so it is safe on a discovery path that must keep to
    /// its deadline.
    pub async fn known_or_advertised(&self, advertisement: &BleAdvertisement) -> bool {
        self.get(&advertisement.address)
            .await
            .unwrap_or(advertisement.connectable)
    }

    /// Cached result for `address`, if any
    pub async fn get(&self, address: &str) -> Option<bool> {
        self.entries.read().await.get(&normalize(address)).copied()
    }

    /// Forget every cached result
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn normalize(address: &str) -> String {
    address.to_uppercase()
}
