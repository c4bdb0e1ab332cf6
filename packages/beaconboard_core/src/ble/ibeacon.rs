//! iBeacon advertisement frames
//!
//! A beacon is advertised as manufacturer-specific data: the 2-byte company
//! identifier (little-endian) followed by the 23-byte iBeacon frame
//! `0x02 0x15 | uuid (16) | major (BE) | minor (BE) | tx power`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Company identifier the board advertises under by default.
pub const DEFAULT_COMPANY_ID: u16 = 0x00E0;

/// Proximity UUID the board advertises by default.
pub const DEFAULT_BEACON_UUID: Uuid = Uuid::from_u128(0x44C13E43_097A_9C9F_537F_5666A6840C08);

pub const DEFAULT_MAJOR: u16 = 0x1234;
pub const DEFAULT_MINOR: u16 = 0x4321;

/// Calibrated RSSI at one metre.
pub const DEFAULT_TX_POWER: i8 = -59;

const FRAME_PREFIX: [u8; 2] = [0x02, 0x15];
pub const FRAME_LEN: usize = 23;

/// The identity a beacon broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconParams {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub tx_power: i8,
}

impl Default for BeaconParams {
    fn default() -> Self {
        Self {
            uuid: DEFAULT_BEACON_UUID,
            major: DEFAULT_MAJOR,
            minor: DEFAULT_MINOR,
            tx_power: DEFAULT_TX_POWER,
        }
    }
}

impl BeaconParams {
    pub fn to_frame(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0..2].copy_from_slice(&FRAME_PREFIX);
        frame[2..18].copy_from_slice(self.uuid.as_bytes());
        frame[18..20].copy_from_slice(&self.major.to_be_bytes());
        frame[20..22].copy_from_slice(&self.minor.to_be_bytes());
        frame[22] = self.tx_power as u8;
        frame
    }

    fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() != FRAME_LEN || frame[0..2] != FRAME_PREFIX {
            return None;
        }
        let uuid = Uuid::from_slice(&frame[2..18]).ok()?;
        let major = u16::from_be_bytes([frame[18], frame[19]]);
        let minor = u16::from_be_bytes([frame[20], frame[21]]);
        Some(Self {
            uuid,
            major,
            minor,
            tx_power: frame[22] as i8,
        })
    }
}

/// Build the manufacturer-specific payload for a beacon.
pub fn manufacturer_payload(company_id: u16, beacon: &BeaconParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + FRAME_LEN);
    buf.extend_from_slice(&company_id.to_le_bytes());
    buf.extend_from_slice(&beacon.to_frame());
    buf
}

/// A beacon decoded from observed manufacturer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IBeacon {
    /// Present when the payload carried the company identifier prefix.
    pub company_id: Option<u16>,
    pub params: BeaconParams,
}

impl IBeacon {
    /// Recognise an iBeacon frame, with or without the company prefix.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() == FRAME_LEN {
            return BeaconParams::from_frame(data).map(|params| Self {
                company_id: None,
                params,
            });
        }
        if data.len() == FRAME_LEN + 2 {
            let company_id = u16::from_le_bytes([data[0], data[1]]);
            return BeaconParams::from_frame(&data[2..]).map(|params| Self {
                company_id: Some(company_id),
                params,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_layout() {
        let frame = BeaconParams::default().to_frame();
        assert_eq!(&frame[0..2], &[0x02, 0x15]);
        assert_eq!(&frame[2..6], &[0x44, 0xC1, 0x3E, 0x43]);
        assert_eq!(&frame[18..20], &[0x12, 0x34]);
        assert_eq!(&frame[20..22], &[0x43, 0x21]);
        assert_eq!(frame[22], 0xC5);
    }

    #[test]
    fn test_manufacturer_payload_prefix() {
        let payload = manufacturer_payload(DEFAULT_COMPANY_ID, &BeaconParams::default());
        assert_eq!(payload.len(), 25);
        assert_eq!(&payload[0..4], &[0xE0, 0x00, 0x02, 0x15]);
    }

    #[test]
    fn test_parse_with_and_without_company_prefix() {
        let beacon = BeaconParams {
            major: 7,
            minor: 9,
            ..BeaconParams::default()
        };

        let parsed = IBeacon::parse(&manufacturer_payload(0x004C, &beacon)).unwrap();
        assert_eq!(parsed.company_id, Some(0x004C));
        assert_eq!(parsed.params, beacon);

        let parsed = IBeacon::parse(&beacon.to_frame()).unwrap();
        assert_eq!(parsed.company_id, None);
        assert_eq!(parsed.params, beacon);
    }

    #[test]
    fn test_parse_rejects_other_payloads() {
        assert!(IBeacon::parse(&[]).is_none());
        assert!(IBeacon::parse(&[0x02, 0x15, 0x00]).is_none());

        let mut frame = BeaconParams::default().to_frame();
        frame[1] = 0x16;
        assert!(IBeacon::parse(&frame).is_none());
    }
}
