//! BLE capability provider layer
//!
//! Provides the scan/advertise traits the rest of the crate is written
//! against, an iBeacon frame codec, a simulated transport for testing,
//! and (behind `ble-central`) a btleplug-backed central.

#[cfg(feature = "ble-central")]
pub mod btle;
pub mod ibeacon;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Adapter error: {0}")]
    AdapterError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Not supported by this provider: {0}")]
    Unsupported(&'static str),
}
