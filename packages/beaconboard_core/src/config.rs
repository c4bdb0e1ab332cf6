//! Board configuration
//!
//! Defaults reproduce the board's stock setup: unfiltered scans with
//! duplicates reported, and an iBeacon under company id 0x00E0.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::ibeacon::{BeaconParams, DEFAULT_COMPANY_ID};
use crate::ble::transport::ScanOptions;
use crate::permissions::Platform;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid hex value {value:?}: {reason}")]
    InvalidHex { value: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub platform: Platform,
    pub scan: ScanOptions,
    pub company_id: u16,
    pub beacon: BeaconParams,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Desktop,
            scan: ScanOptions::default(),
            company_id: DEFAULT_COMPANY_ID,
            beacon: BeaconParams::default(),
        }
    }
}

impl BoardConfig {
    /// Load a config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}

/// Parse a 16-bit value written in hex, with or without a `0x` prefix.
///
/// Plain digits are hex too: `"1234"` is 0x1234.
pub fn parse_hex_u16(value: &str) -> Result<u16, ConfigError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).map_err(|e| ConfigError::InvalidHex {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
