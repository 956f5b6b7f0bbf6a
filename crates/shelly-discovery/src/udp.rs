//! UDP socket plumbing shared by the mDNS and CoIoT listeners
//!
//! Each socket gets one reader task that only receives and hands datagrams
//! to a bounded channel. Parsing happens on the consumer side, so a slow
//! parser never stalls the socket. When the channel is full the datagram is
//! dropped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{DiscoveryError, Result};

/// Capacity of the reader -> parser channel
pub const DATAGRAM_CHANNEL_CAPACITY: usize = 100;

/// Receive buffer size; larger than any discovery datagram we care about
const RECV_BUFFER_SIZE: usize = 4096;

/// A received datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub source: SocketAddr,
}

/// Bind a UDP socket, mapping failure to a setup error
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| DiscoveryError::Bind { addr, source })
}

/// Bind `0.0.0.0:port` and try to join `group`
///
/// If the join fails the socket is kept as a plain unicast listener.
pub async fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = bind(addr).await?;

    match join_multicast(&socket, group) {
        Ok(()) => debug!(group = %group, port = port, "Joined multicast group"),
        Err(e) => warn!(
            port = port,
            error = %e,
            "Multicast join failed, listening on unicast only"
        ),
    }

    Ok(socket)
}

/// Join `group` on the default interface
pub fn join_multicast(socket: &UdpSocket, group: Ipv4Addr) -> Result<()> {
    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .map_err(|e| DiscoveryError::MulticastJoin(format!("{}: {}", group, e)))
}

/// Spawn the reader loop for `socket`
///
/// The task exits when `cancel` fires or the receiving side of `tx` is
/// dropped. Read errors are transient and do not end the loop.
pub fn spawn_reader(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Datagram>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => r,
            };

            if deliver(received, &buf, &tx).is_break() {
                break;
            }
        }
        trace!("UDP reader exited");
    })
}

/// Hand one receive result to the channel; breaks only once the consumer is gone
fn deliver(
    received: io::Result<(usize, SocketAddr)>,
    buf: &[u8],
    tx: &mpsc::Sender<Datagram>,
) -> ControlFlow<()> {
    match received {
        Ok((n, source)) => {
            let datagram = Datagram {
                data: buf[..n].to_vec(),
                source,
            };
            match tx.try_send(datagram) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(d)) => {
                    trace!(source = %d.source, "Datagram channel full, dropping packet");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return ControlFlow::Break(()),
            }
        }
        Err(e) => {
            trace!(error = %e, "UDP recv error");
        }
    }
    ControlFlow::Continue(())
}
