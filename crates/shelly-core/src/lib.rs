//! Shelly Core - Device types shared across discovery protocols
//!
//! This crate provides the record every discovery listener produces:
//! - `DiscoveredDevice`, the unified per-observation device record
//! - `Protocol`, which mechanism produced the observation
//! - `Generation`, the device hardware/firmware generation

pub mod device;

pub use device::{DiscoveredDevice, Generation, Protocol, DEFAULT_HTTP_PORT};
