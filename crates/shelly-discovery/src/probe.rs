//! Address-range identification
//!
//! For networks where multicast is filtered: ask every address in a range
//! who it is and keep the ones that answer like a device.

use shelly_core::{DiscoveredDevice, Protocol};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::error::{DiscoveryError, Result};
use crate::identify::DeviceIdentifier;

/// Identification requests in flight at once
pub const MAX_CONCURRENT_PROBES: usize = 64;

/// Largest subnet (smallest prefix) accepted for a scan
pub const MIN_PREFIX_LEN: u8 = 16;

fn subnet_mask(prefix_len: u8) -> u32 {
    if prefix_len >= 32 {
        0xFFFFFFFF
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    }
}

/// Host addresses of `subnet/prefix_len`
///
/// Network and broadcast addresses are skipped except for /31 and /32.
pub fn subnet_hosts(subnet: Ipv4Addr, prefix_len: u8) -> Result<Vec<Ipv4Addr>> {
    if !(MIN_PREFIX_LEN..=32).contains(&prefix_len) {
        return Err(DiscoveryError::InvalidSubnet(format!("{}/{}", subnet, prefix_len)));
    }

    let mask = subnet_mask(prefix_len);
    let network = u32::from(subnet) & mask;
    let broadcast = network | !mask;

    let hosts = if prefix_len >= 31 {
        (network..=broadcast).map(Ipv4Addr::from).collect()
    } else {
        ((network + 1)..broadcast).map(Ipv4Addr::from).collect()
    };
    Ok(hosts)
}

/// Identify every host concurrently; hosts that do not answer are skipped
pub async fn identify_hosts(
    identifier: Arc<dyn DeviceIdentifier>,
    hosts: &[IpAddr],
    port: u16,
    timeout: Duration,
) -> Vec<DiscoveredDevice> {
    let limit = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let mut tasks = JoinSet::new();

    for &host in hosts {
        let identifier = identifier.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.ok()?;
            match identifier.identify(host, port, timeout).await {
                Ok(info) => info.into_device(host, port, Protocol::Manual),
                Err(e) => {
                    trace!(ip = %host, error = %e, "No device at address");
                    None
                }
            }
        });
    }

    let mut devices = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some(device)) = result {
            debug!(id = %device.id, model = %device.model, "Identified device by address");
            devices.push(device);
        }
    }

    info!(
        probed = hosts.len(),
        found = devices.len(),
        "Address probe complete"
    );
    devices
}
