// Beaconboard - BLE advertise/scan board with peripheral discovery aggregation

pub mod ble;
pub mod config;
pub mod discovery;
pub mod permissions;
pub mod session;
pub mod view;

pub use ble::transport::{BleCentral, BlePeripheral, RawAdvertisement, ScanOptions};
pub use ble::BleError;
pub use config::BoardConfig;
pub use discovery::{DiscoveryError, DiscoveryRegistry, PeripheralRecord};
pub use session::{Controls, SessionController, SessionError};
