//! Canonical peripheral records

use serde::{Deserialize, Serialize};

use super::DiscoveryError;
use crate::ble::transport::RawAdvertisement;

/// Display name used when a device advertises no name.
pub const NO_NAME: &str = "NO NAME";

/// The latest known state of one discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralRecord {
    pub id: String,
    pub display_name: String,
    pub rssi: i16,
    /// Manufacturer data as lowercase hex, two digits per byte.
    pub raw_data_hex: String,
    pub local_name: Option<String>,
}

impl PeripheralRecord {
    /// Normalize one advertisement. Fails only on an empty device id.
    pub fn from_advertisement(raw: RawAdvertisement) -> Result<Self, DiscoveryError> {
        if raw.id.is_empty() {
            return Err(DiscoveryError::InvalidInput(
                "advertisement has an empty device id".to_string(),
            ));
        }

        let display_name = match raw.name {
            Some(name) if !name.is_empty() => name,
            _ => NO_NAME.to_string(),
        };

        Ok(Self {
            id: raw.id,
            display_name,
            rssi: raw.rssi,
            raw_data_hex: hex::encode(&raw.manufacturer_data),
            local_name: raw.local_name,
        })
    }

    /// Decode the hex payload back into bytes.
    pub fn raw_data(&self) -> Vec<u8> {
        hex::decode(&self.raw_data_hex).unwrap_or_default()
    }
}
