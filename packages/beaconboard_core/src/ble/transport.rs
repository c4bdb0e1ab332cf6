//! BLE transport trait definitions and core types
//!
//! Defines the abstract capability provider that both the simulated
//! transport and the btleplug central conform to. The crate never talks to
//! a radio directly: scanning, advertising, and event delivery all go
//! through [`BleCentral`] and [`BlePeripheral`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::ibeacon::BeaconParams;
use super::BleError;
use crate::discovery::DiscoveryError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(mac) => {
                let parts: Vec<String> = mac.iter().map(|b| format!("{:02X}", b)).collect();
                write!(f, "{}", parts.join(":"))
            }
            BleAddress::Simulated(id) => write!(f, "{}", id),
        }
    }
}

/// One observed advertisement packet, as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAdvertisement {
    /// Stable device identifier for the current scan session.
    pub id: String,
    /// Complete device name, if the provider resolved one.
    #[serde(default)]
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Manufacturer-specific payload, in packet order.
    #[serde(default, deserialize_with = "nullable_bytes")]
    pub manufacturer_data: Vec<u8>,
    /// Shortened local name from the advertising data.
    #[serde(default)]
    pub local_name: Option<String>,
}

fn nullable_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<u8>>::deserialize(deserializer)?.unwrap_or_default())
}

impl RawAdvertisement {
    pub fn new(id: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi,
            manufacturer_data: Vec::new(),
            local_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = Some(local_name.into());
        self
    }

    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.manufacturer_data = data;
        self
    }

    /// Parse one event from its JSON form.
    ///
    /// Manufacturer bytes outside 0-255 are rejected rather than clamped.
    pub fn from_json(json: &str) -> Result<Self, DiscoveryError> {
        serde_json::from_str(json).map_err(|e| DiscoveryError::InvalidInput(e.to_string()))
    }
}

/// Android scan mode constants.
///
/// Carried in the config to mirror Android's `ScanSettings`;
/// neither the simulator nor btleplug exposes a scan mode, so no provider
/// here reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Opportunistic,
    LowPower,
    Balanced,
    LowLatency,
}

impl ScanMode {
    pub fn as_android_constant(self) -> i32 {
        match self {
            ScanMode::Opportunistic => -1,
            ScanMode::LowPower => 0,
            ScanMode::Balanced => 1,
            ScanMode::LowLatency => 2,
        }
    }
}

/// Parameters for a scan session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Only report peripherals advertising one of these services (empty = all).
    pub service_uuids: Vec<Uuid>,
    /// Stop scanning after this many seconds (0 = until stopped).
    pub timeout_secs: u64,
    /// Report every packet rather than the first one per device.
    pub allow_duplicates: bool,
    /// Not read by the bundled providers; see [`ScanMode`].
    pub scan_mode: ScanMode,
    /// Batch delay for platforms with batched scan results. Not read by the
    /// bundled providers, which deliver every packet as it arrives.
    pub report_delay_ms: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            service_uuids: Vec::new(),
            timeout_secs: 0,
            allow_duplicates: true,
            scan_mode: ScanMode::Balanced,
            report_delay_ms: 1800,
        }
    }
}

/// BLE central role: scanning for advertisements.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning for BLE advertisements.
    async fn start_scan(&self, options: &ScanOptions) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to discovered advertisements.
    fn advertisements(&self) -> broadcast::Receiver<RawAdvertisement>;

    /// Whether the radio is scanning. Drops to `false` when the provider
    /// ends a scan by itself, e.g. once `timeout_secs` elapses.
    fn scan_state(&self) -> watch::Receiver<bool>;
}

/// BLE peripheral role: broadcasting an iBeacon.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Set the company identifier carried in the manufacturer data.
    async fn set_company_id(&self, company_id: u16) -> Result<(), BleError>;

    /// Start advertising the given beacon.
    async fn start_advertising(&self, beacon: &BeaconParams) -> Result<(), BleError>;

    /// Stop advertising.
    async fn stop_advertising(&self) -> Result<(), BleError>;
}
