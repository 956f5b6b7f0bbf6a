//! mDNS discovery for Gen2+ devices
//!
//! Sends a PTR query for `_shelly._tcp.local.` and reads the responses.
//! Response decoding is permissive: TXT-style `key=value`
//! markers are scanned from the raw payload, and the device address comes
//! from the first A record (falling back to a byte-level scan for a
//! private/loopback IPv4 address).

use async_trait::async_trait;
use shelly_core::{DiscoveredDevice, Generation, Protocol, DEFAULT_HTTP_PORT};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discoverer::{
    forward, reap_finished, BackgroundTask, Discoverer, DEVICE_CHANNEL_CAPACITY,
};
use crate::error::{DiscoveryError, Result};
use crate::udp::{self, DATAGRAM_CHANNEL_CAPACITY};

/// Service advertised by Shelly devices
pub const SHELLY_SERVICE: &str = "_shelly._tcp.local.";

/// mDNS multicast group and port
pub const MDNS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)), 5353);

/// How often continuous mode re-sends the query
pub const REQUERY_INTERVAL: Duration = Duration::from_secs(10);

const DNS_HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const CLASS_IN: u16 = 1;

/// Build a minimal DNS query with a single PTR question for `service`
pub fn build_query(service: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(DNS_HEADER_LEN + service.len() + 6);

    // ID=0, flags=0, QDCOUNT=1, AN/NS/AR=0
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    for label in service.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = &label.as_bytes()[..label.len().min(63)];
        packet.push(bytes.len() as u8);
        packet.extend_from_slice(bytes);
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_PTR.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

/// Decode a response datagram into a device
///
/// Returns `None` for queries, short packets, and responses that carry
/// neither an `id=` marker nor a usable address.
pub fn parse_response(data: &[u8], source: SocketAddr) -> Option<DiscoveredDevice> {
    if data.len() < DNS_HEADER_LEN || data[2] & 0x80 == 0 {
        return None;
    }

    let markers = Markers::new(data);
    let marker_id = markers.get("id");
    let record_addr = find_a_record(data).or_else(|| scan_private_ipv4(&data[DNS_HEADER_LEN..]));

    let id = match (&marker_id, record_addr) {
        (Some(id), _) => id.clone(),
        (None, Some(addr)) => addr.to_string(),
        (None, None) => return None,
    };

    let mut device = DiscoveredDevice::new(id.clone(), Protocol::Mdns);
    device.name = id;
    device.model = markers
        .get("model")
        .or_else(|| markers.get("app"))
        .unwrap_or_default();
    device.firmware = markers
        .get("fw")
        .or_else(|| markers.get("ver"))
        .unwrap_or_default();
    device.generation = parse_generation(markers.get("gen").as_deref());
    device.auth_required = markers
        .get("auth")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    device.address = Some(record_addr.map(IpAddr::V4).unwrap_or_else(|| source.ip()));
    device.port = DEFAULT_HTTP_PORT;
    device.raw = Some(data.to_vec());

    Some(device)
}

/// Unknown or missing generations are treated as Gen2+
fn parse_generation(value: Option<&str>) -> Generation {
    match value {
        Some("1") => Generation::Gen1,
        Some("3") => Generation::Gen3,
        _ => Generation::Gen2,
    }
}

/// `key=value` lookups over a response
///
/// Entries of well-formed TXT records are used first; the raw byte scan
/// covers responses whose records cannot be walked.
struct Markers<'a> {
    data: &'a [u8],
    txt: Vec<(&'a [u8], &'a [u8])>,
}

impl<'a> Markers<'a> {
    fn new(data: &'a [u8]) -> Self {
        let txt = records(data)
            .into_iter()
            .filter(|&(rtype, _)| rtype == TYPE_TXT)
            .flat_map(|(_, rdata)| txt_strings(rdata))
            .filter_map(|entry| {
                let eq = entry.iter().position(|&b| b == b'=')?;
                Some((&entry[..eq], &entry[eq + 1..]))
            })
            .collect();
        Self { data, txt }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.txt
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(key.as_bytes()) && !v.is_empty())
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            .or_else(|| find_marker(self.data, format!("{}=", key).as_bytes()))
    }
}

/// Split TXT rdata into its length-prefixed strings
fn txt_strings(mut rdata: &[u8]) -> Vec<&[u8]> {
    let mut strings = Vec::new();
    while let Some((&len, rest)) = rdata.split_first() {
        let Some(entry) = rest.get(..len as usize) else {
            break;
        };
        strings.push(entry);
        rdata = &rest[len as usize..];
    }
    strings
}

/// Find `key` in the payload and return the text up to the next space, NUL,
/// newline or other control byte
///
/// A match preceded by an identifier character (`fw_id=` for `id=`) or
/// with an empty value is skipped.
fn find_marker(data: &[u8], key: &[u8]) -> Option<String> {
    let mut start = 0;
    while start + key.len() <= data.len() {
        let pos = start + data[start..].windows(key.len()).position(|w| w == key)?;
        let preceded_by_word = pos > 0 && {
            let prev = data[pos - 1];
            prev.is_ascii_alphanumeric() || prev == b'_'
        };

        if !preceded_by_word {
            let value_start = pos + key.len();
            let value_end = data[value_start..]
                .iter()
                .position(|&b| b == b' ' || b < 0x20 || b == 0x7f)
                .map(|off| value_start + off)
                .unwrap_or(data.len());
            if value_end > value_start {
                return Some(String::from_utf8_lossy(&data[value_start..value_end]).into_owned());
            }
        }
        start = pos + 1;
    }
    None
}

/// Resource records as (type, rdata), up to the first malformed one
fn records(data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut found = Vec::new();
    if data.len() < DNS_HEADER_LEN {
        return found;
    }

    let count = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]) as usize;
    let questions = count(4);
    let total = count(6) + count(8) + count(10);

    let mut pos = DNS_HEADER_LEN;
    for _ in 0..questions {
        match skip_name(data, pos) {
            Some(end) => pos = end + 4,
            None => return found,
        }
    }

    for _ in 0..total {
        let Some(end) = skip_name(data, pos) else {
            break;
        };
        let Some(fixed) = data.get(end..end + 10) else {
            break;
        };
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos = end + 10;
        let Some(rdata) = data.get(pos..pos + rdlen) else {
            break;
        };
        found.push((rtype, rdata));
        pos += rdlen;
    }
    found
}

/// First A record of the response
fn find_a_record(data: &[u8]) -> Option<Ipv4Addr> {
    records(data).into_iter().find_map(|(rtype, rdata)| match rdata {
        &[a, b, c, d] if rtype == TYPE_A => Some(Ipv4Addr::new(a, b, c, d)),
        _ => None,
    })
}

/// Skip a (possibly compressed) domain name starting at `pos`
fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            data.get(pos + 1)?;
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

/// Scan for any 4-byte run that reads as a private or loopback IPv4 address
fn scan_private_ipv4(data: &[u8]) -> Option<Ipv4Addr> {
    data.windows(4)
        .map(|w| Ipv4Addr::new(w[0], w[1], w[2], w[3]))
        .find(|ip| ip.is_private() || ip.is_loopback())
}

/// mDNS discoverer
pub struct MdnsDiscoverer {
    service: String,
    target: SocketAddr,
    continuous: RwLock<Option<BackgroundTask>>,
}

impl Default for MdnsDiscoverer {
    fn default() -> Self {
        Self::new(SHELLY_SERVICE)
    }
}

impl MdnsDiscoverer {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            target: MDNS_ADDR,
            continuous: RwLock::new(None),
        }
    }

    /// Send queries to `target` instead of the mDNS multicast group
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    async fn open_socket(&self) -> Result<Arc<tokio::net::UdpSocket>> {
        let socket = udp::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        Ok(Arc::new(socket))
    }
}

#[async_trait]
impl Discoverer for MdnsDiscoverer {
    fn protocol(&self) -> Protocol {
        Protocol::Mdns
    }

    async fn discover_with_cancel(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        let socket = self.open_socket().await?;
        let query = build_query(&self.service);
        socket.send_to(&query, self.target).await?;

        info!(service = %self.service, target = %self.target, "mDNS query sent");

        let (tx, mut rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let reader_cancel = cancel.child_token();
        let reader = udp::spawn_reader(socket, tx, reader_cancel.clone());

        let mut devices: HashMap<String, DiscoveredDevice> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = rx.recv() => match datagram {
                    Some(datagram) => {
                        if let Some(device) = parse_response(&datagram.data, datagram.source) {
                            debug!(id = %device.id, address = ?device.address, "mDNS device found");
                            devices.insert(device.id.clone(), device);
                        }
                    }
                    None => break,
                },
            }
        }

        reader_cancel.cancel();
        let _ = reader.await;

        info!(count = devices.len(), "mDNS discovery complete");
        Ok(devices.into_values().collect())
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveredDevice>> {
        reap_finished(&self.continuous).await;
        if self.continuous.read().await.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let socket = self.open_socket().await?;
        let query = build_query(&self.service);
        let target = self.target;
        let (device_tx, device_rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);

        let mut continuous = self.continuous.write().await;
        if continuous.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        *continuous = Some(BackgroundTask::spawn(move |cancel| async move {
            let (tx, mut rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
            let reader_cancel = cancel.child_token();
            let reader = udp::spawn_reader(socket.clone(), tx, reader_cancel.clone());
            let mut ticker = tokio::time::interval(REQUERY_INTERVAL);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = device_tx.closed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&query, target).await {
                            debug!(error = %e, "mDNS re-query failed");
                        }
                    }
                    datagram = rx.recv() => match datagram {
                        Some(datagram) => {
                            if let Some(device) = parse_response(&datagram.data, datagram.source) {
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

        info!(service = %self.service, "mDNS continuous discovery started");
        Ok(device_rx)
    }

    async fn stop_discovery(&self) -> Result<()> {
        let task = self.continuous.write().await.take();
        if let Some(task) = task {
            task.shutdown().await;
            info!("mDNS continuous discovery stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn source() -> SocketAddr {
        "192.168.1.50:5353".parse().unwrap()
    }

    /// Response header with one answer, followed by `body`
    fn response(body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        packet.extend_from_slice(body);
        packet
    }

    fn a_record_response(ip: [u8; 4], txt: &[u8]) -> Vec<u8> {
        let mut packet = vec![0, 0, 0x84, 0, 0, 0, 0, 2, 0, 0, 0, 0];
        // A record: name "dev.local", type A, class IN, ttl, rdlen 4
        packet.extend_from_slice(b"\x03dev\x05local\x00");
        packet.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 120, 0, 4]);
        packet.extend_from_slice(&ip);
        // TXT record with compressed name
        packet.extend_from_slice(&[0xC0, 12, 0, 16, 0, 1, 0, 0, 0, 120]);
        packet.extend_from_slice(&(txt.len() as u16).to_be_bytes());
        packet.extend_from_slice(txt);
        packet
    }

    #[test]
    fn test_build_query() {
        let query = build_query(SHELLY_SERVICE);
        assert_eq!(&query[..12], &[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&query[12..20], b"\x07_shelly");
        assert_eq!(&query[20..25], b"\x04_tcp");
        assert_eq!(&query[25..31], b"\x05local");
        assert_eq!(query[31], 0);
        assert_eq!(&query[32..], &[0, 12, 0, 1]);
    }

    #[test]
    fn test_rejects_queries_and_short_packets() {
        assert!(parse_response(&[0x84; 8], source()).is_none());
        let query = build_query(SHELLY_SERVICE);
        assert!(parse_response(&query, source()).is_none());
    }

    #[test]
    fn test_parses_markers() {
        let packet = response(b"\x1cid=shellyplus1pm-a8032ab1c2d3\x0bmodel=SNSW-1\x05gen=2\x08fw=1.0.8\x06auth=1");
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "shellyplus1pm-a8032ab1c2d3");
        assert_eq!(device.name, "shellyplus1pm-a8032ab1c2d3");
        assert_eq!(device.model, "SNSW-1");
        assert_eq!(device.firmware, "1.0.8");
        assert_eq!(device.generation, Generation::Gen2);
        assert!(device.auth_required);
        assert_eq!(device.protocol, Protocol::Mdns);
        assert_eq!(device.port, 80);
    }

    #[test]
    fn test_marker_terminators() {
        let packet = response(b"id=abc def model=X\0 fw=1.2\n");
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "abc");
        assert_eq!(device.model, "X");
        assert_eq!(device.firmware, "1.2");
    }

    #[test]
    fn test_marker_ignores_suffix_keys() {
        let packet = response(b" fw_id=20230913 id=real");
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "real");
    }

    #[test]
    fn test_marker_skips_empty_value() {
        let packet = response(b" id= other id=real");
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "real");
    }

    #[test]
    fn test_txt_entries_with_alphanumeric_length_bytes() {
        // 48- and 55-byte entries: their length prefixes are '0' and '7'
        let id = format!("id=shellypro4pm-{}", "c".repeat(32));
        let model = format!("model=SPSW-104PE16EU-{}", "x".repeat(34));
        assert_eq!((id.len(), model.len()), (0x30, 0x37));

        let mut txt = vec![id.len() as u8];
        txt.extend_from_slice(id.as_bytes());
        txt.push(model.len() as u8);
        txt.extend_from_slice(model.as_bytes());
        txt.extend_from_slice(b"\x05gen=2");

        let device = parse_response(&a_record_response([192, 168, 1, 8], &txt), source()).unwrap();
        assert_eq!(device.id, id["id=".len()..]);
        assert_eq!(device.model, model["model=".len()..]);
        assert_eq!(device.generation, Generation::Gen2);
    }

    #[test]
    fn test_txt_strings_stop_at_truncation() {
        let strings = txt_strings(b"\x03a=1\x09b=2");
        assert_eq!(strings, vec![b"a=1".as_slice()]);
    }

    #[test]
    fn test_unknown_generation_defaults_to_gen2() {
        for (gen, expected) in [
            ("1", Generation::Gen1),
            ("2", Generation::Gen2),
            ("3", Generation::Gen3),
            ("7", Generation::Gen2),
            ("x", Generation::Gen2),
        ] {
            let packet = response(format!(" id=dev gen={}", gen).as_bytes());
            let device = parse_response(&packet, source()).unwrap();
            assert_eq!(device.generation, expected, "gen={}", gen);
        }
    }

    #[test]
    fn test_address_from_a_record() {
        let packet = a_record_response([192, 168, 1, 77], b"\x07id=dev1");
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "dev1");
        assert_eq!(device.address, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77))));
    }

    #[test]
    fn test_address_only_record_uses_address_as_id() {
        let packet = a_record_response([10, 0, 0, 9], b"\x05gen=2");
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "10.0.0.9");
    }

    #[test]
    fn test_heuristic_private_address() {
        let packet = response(&[0xFF, 0xFF, 192, 168, 5, 6, 0xFF]);
        let device = parse_response(&packet, source()).unwrap();
        assert_eq!(device.id, "192.168.5.6");
        assert_eq!(device.address, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 5, 6))));
    }

    #[test]
    fn test_discards_without_id_or_address() {
        let packet = response(&[0xFF, 0xFF, 0xFF, 8, 8, 8, 8]);
        assert!(parse_response(&packet, source()).is_none());
    }

    #[tokio::test]
    async fn test_discover_against_loopback_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((n, from)) = responder.recv_from(&mut buf).await {
                assert_eq!(&buf[..n], build_query(SHELLY_SERVICE).as_slice());
                let reply = response(b" id=shelly1-aabbcc model=SHSW-1 gen=1");
                let _ = responder.send_to(&reply, from).await;
                let _ = responder.send_to(&reply, from).await;
            }
        });

        let discoverer = MdnsDiscoverer::default().with_target(target);
        let devices = discoverer.discover(Duration::from_millis(300)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "shelly1-aabbcc");
        assert_eq!(devices[0].generation, Generation::Gen1);
    }

    #[tokio::test]
    async fn test_continuous_mode_start_stop() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, from)) = responder.recv_from(&mut buf).await {
                let _ = responder.send_to(&response(b" id=plus-1"), from).await;
            }
        });

        let discoverer = MdnsDiscoverer::default().with_target(target);
        let mut rx = discoverer.start_discovery().await.unwrap();
        assert!(matches!(
            discoverer.start_discovery().await,
            Err(DiscoveryError::AlreadyRunning)
        ));

        let device = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.id, "plus-1");

        discoverer.stop_discovery().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_after_consumer_dropped() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discoverer = MdnsDiscoverer::default().with_target(responder.local_addr().unwrap());

        drop(discoverer.start_discovery().await.unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            match discoverer.start_discovery().await {
                Ok(_) => break,
                Err(DiscoveryError::AlreadyRunning) => {
                    assert!(std::time::Instant::now() < deadline);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        discoverer.stop_discovery().await.unwrap();
    }
}
