//! Error types for discovery operations
//!
//! Malformed packets and advertisements are never errors: parsers return
//! `None` and the packet is dropped. Errors here are setup failures and
//! platform capability problems that callers need to tell apart from
//! "nothing found".

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to bind socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to join multicast group {0}")]
    MulticastJoin(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("BLE is not supported on this platform")]
    BleNotSupported,
    #[error("WiFi scanning is not supported on this platform")]
    WifiNotSupported,
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("SSID not found: {0}")]
    SsidNotFound(String),
    #[error("No network connection tool available")]
    NoConnectionTool,
    #[error("Continuous discovery already running")]
    AlreadyRunning,
    #[error("Platform error: {0}")]
    Platform(String),
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),
    #[error("Identification failed: {0}")]
    Identify(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
