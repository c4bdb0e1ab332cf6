//! Peripheral discovery aggregation
//!
//! Turns the stream of raw scan events into one record per device, in the
//! order devices were first seen, ready to render as a list.

pub mod record;
pub mod registry;

pub use record::{PeripheralRecord, NO_NAME};
pub use registry::DiscoveryRegistry;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Invalid advertisement: {0}")]
    InvalidInput(String),
}
