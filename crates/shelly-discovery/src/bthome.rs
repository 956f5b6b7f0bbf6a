//! BTHome v2 sensor telemetry decoding
//!
//! A BTHome service-data payload is a device-info byte followed by a
//! sequence of `(object id, value)` tuples. Value sizes are fixed per object
//! id. All multi-byte values are little-endian.

use serde::{Deserialize, Serialize};

/// 16-bit BTHome service UUID
pub const BTHOME_SERVICE_UUID: &str = "fcd2";

const FLAG_ENCRYPTED: u8 = 0x01;

const OBJ_PACKET_ID: u8 = 0x00;
const OBJ_BATTERY: u8 = 0x01;
const OBJ_TEMPERATURE: u8 = 0x02;
const OBJ_HUMIDITY: u8 = 0x03;
const OBJ_ILLUMINANCE: u8 = 0x05;
const OBJ_MOTION: u8 = 0x21;
const OBJ_WINDOW: u8 = 0x2D;
const OBJ_BUTTON: u8 = 0x3A;
const OBJ_ROTATION: u8 = 0x3F;

/// Decoded sensor values; `None` means the object was not in the payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtHomeData {
    pub packet_id: Option<u8>,
    /// Battery level in percent
    pub battery: Option<u8>,
    /// Temperature in °C
    pub temperature: Option<f64>,
    /// Relative humidity in percent
    pub humidity: Option<f64>,
    /// Illuminance in lux
    pub illuminance: Option<f64>,
    pub motion: Option<bool>,
    /// Window/door open
    pub window: Option<bool>,
    /// Button event code
    pub button: Option<u8>,
    /// Rotation in degrees
    pub rotation: Option<f64>,
}

/// Value size in bytes for an object id; unknown ids are assumed 1 byte
fn object_size(object_id: u8) -> usize {
    match object_id {
        OBJ_PACKET_ID | OBJ_BATTERY | OBJ_MOTION | OBJ_WINDOW | OBJ_BUTTON => 1,
        OBJ_TEMPERATURE | OBJ_HUMIDITY | OBJ_ROTATION => 2,
        OBJ_ILLUMINANCE => 3,
        _ => 1,
    }
}

/// Decode a BTHome v2 service-data payload
///
/// Returns `None` for an empty or encrypted payload. A truncated trailing
/// object is dropped and everything decoded before it is kept.
pub fn parse_bthome_data(data: &[u8]) -> Option<BtHomeData> {
    let (&flags, mut rest) = data.split_first()?;
    if flags & FLAG_ENCRYPTED != 0 {
        return None;
    }

    let mut result = BtHomeData::default();
    while let Some((&object_id, tail)) = rest.split_first() {
        let size = object_size(object_id);
        if tail.len() < size {
            break;
        }
        let (value, next) = tail.split_at(size);
        rest = next;

        match object_id {
            OBJ_PACKET_ID => result.packet_id = Some(value[0]),
            OBJ_BATTERY => result.battery = Some(value[0]),
            OBJ_TEMPERATURE => {
                result.temperature = Some(i16::from_le_bytes([value[0], value[1]]) as f64 * 0.01)
            }
            OBJ_HUMIDITY => {
                result.humidity = Some(u16::from_le_bytes([value[0], value[1]]) as f64 * 0.01)
            }
            OBJ_ILLUMINANCE => {
                let raw = u32::from_le_bytes([value[0], value[1], value[2], 0]);
                result.illuminance = Some(raw as f64 * 0.01)
            }
            OBJ_MOTION => result.motion = Some(value[0] != 0),
            OBJ_WINDOW => result.window = Some(value[0] != 0),
            OBJ_BUTTON => result.button = Some(value[0]),
            OBJ_ROTATION => {
                result.rotation = Some(i16::from_le_bytes([value[0], value[1]]) as f64 * 0.1)
            }
            _ => {}
        }
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("value present");
        assert!((actual - expected).abs() < 1e-9, "{} != {}", actual, expected);
    }

    #[test]
    fn test_battery() {
        let data = parse_bthome_data(&[0x40, 0x01, 0x64]).unwrap();
        assert_eq!(data.battery, Some(100));
        assert_eq!(data.temperature, None);
    }

    #[test]
    fn test_temperature_signed() {
        approx(parse_bthome_data(&[0x40, 0x02, 0xE8, 0x03]).unwrap().temperature, 10.0);
        approx(parse_bthome_data(&[0x40, 0x02, 0x18, 0xFC]).unwrap().temperature, -10.0);
    }

    #[test]
    fn test_multiple_objects() {
        let payload = [
            0x40, // device info, v2 unencrypted
            0x00, 0x2A, // packet id 42
            0x01, 0x55, // battery 85
            0x03, 0xBF, 0x13, // humidity 50.55
            0x05, 0x13, 0x8A, 0x14, // illuminance 13460.67
            0x21, 0x01, // motion
            0x2D, 0x00, // window closed
            0x3A, 0x04, // button long press
            0x3F, 0x9C, 0xFF, // rotation -10.0
        ];
        let data = parse_bthome_data(&payload).unwrap();
        assert_eq!(data.packet_id, Some(42));
        assert_eq!(data.battery, Some(85));
        approx(data.humidity, 50.55);
        approx(data.illuminance, 13460.67);
        assert_eq!(data.motion, Some(true));
        assert_eq!(data.window, Some(false));
        assert_eq!(data.button, Some(4));
        approx(data.rotation, -10.0);
    }

    #[test]
    fn test_encrypted_payload() {
        assert!(parse_bthome_data(&[0x41, 0x01, 0x64]).is_none());
    }

    #[test]
    fn test_empty_payload() {
        assert!(parse_bthome_data(&[]).is_none());
        assert_eq!(parse_bthome_data(&[0x40]), Some(BtHomeData::default()));
    }

    #[test]
    fn test_truncated_trailing_object_dropped() {
        let data = parse_bthome_data(&[0x40, 0x01, 0x50, 0x02, 0xE8]).unwrap();
        assert_eq!(data.battery, Some(80));
        assert_eq!(data.temperature, None);
    }

    #[test]
    fn test_unknown_object_skipped() {
        // 0x50 is not in the table: skipped as a 1-byte value
        let data = parse_bthome_data(&[0x40, 0x50, 0xAA, 0x01, 0x10]).unwrap();
        assert_eq!(data.battery, Some(16));
    }

    #[test]
    fn test_every_prefix_decodes_without_panic() {
        let payload = [0x40, 0x00, 0x01, 0x02, 0xE8, 0x03, 0x05, 0x01, 0x02, 0x03, 0x3F, 0x01];
        for len in 0..=payload.len() {
            let _ = parse_bthome_data(&payload[..len]);
        }
    }
}
