//! In-process BLE simulator
//!
//! Provides a simulated BLE "air" where multiple devices can advertise and
//! scan entirely in-process. Used for integration testing and the demo CLI
//! without requiring real BLE hardware.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI16, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ibeacon::{manufacturer_payload, BeaconParams, DEFAULT_COMPANY_ID};
use super::transport::{BleAddress, BleCentral, BlePeripheral, RawAdvertisement, ScanOptions};
use super::BleError;

/// The simulated "air": a shared medium every simulated device hears.
pub struct SimBleNetwork {
    air_tx: broadcast::Sender<RawAdvertisement>,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        let (air_tx, _) = broadcast::channel(256);
        Arc::new(Self { air_tx })
    }

    /// Create a new simulated BLE device on this network.
    pub fn create_device(self: &Arc<Self>) -> SimBleDevice {
        let (scan_tx, _) = broadcast::channel(256);
        let address = BleAddress::Simulated(Uuid::new_v4());
        SimBleDevice {
            profile: Arc::new(SimProfile {
                id: address.to_string(),
                name: RwLock::new(None),
                local_name: RwLock::new(None),
                rssi: AtomicI16::new(-60),
                company_id: AtomicU16::new(DEFAULT_COMPANY_ID),
            }),
            address,
            network: Arc::clone(self),
            adv_interval: Duration::from_millis(100),
            scan_tx,
            scan_state: Arc::new(watch::channel(false).0),
            scan_task: Mutex::new(None),
            adv_task: Mutex::new(None),
            scan_failure: Mutex::new(None),
            advertise_failure: Mutex::new(None),
        }
    }

    /// Put a packet on the air as if some unseen device had sent it.
    pub fn inject(&self, adv: RawAdvertisement) {
        let _ = self.air_tx.send(adv);
    }
}

/// What a simulated device puts into each packet it sends.
struct SimProfile {
    id: String,
    name: RwLock<Option<String>>,
    local_name: RwLock<Option<String>>,
    rssi: AtomicI16,
    company_id: AtomicU16,
}

impl SimProfile {
    fn packet(&self, manufacturer_data: Vec<u8>) -> RawAdvertisement {
        RawAdvertisement {
            id: self.id.clone(),
            name: self.name.read().clone(),
            rssi: self.rssi.load(Ordering::SeqCst),
            manufacturer_data,
            local_name: self.local_name.read().clone(),
        }
    }

    fn beacon_packet(&self, beacon: &BeaconParams) -> RawAdvertisement {
        let company_id = self.company_id.load(Ordering::SeqCst);
        self.packet(manufacturer_payload(company_id, beacon))
    }
}

/// A simulated BLE device that can act as both central and peripheral.
pub struct SimBleDevice {
    address: BleAddress,
    profile: Arc<SimProfile>,
    network: Arc<SimBleNetwork>,
    /// Period between repeated beacon packets while advertising.
    adv_interval: Duration,
    /// Advertisements heard while scanning, fanned out to subscribers.
    scan_tx: broadcast::Sender<RawAdvertisement>,
    scan_state: Arc<watch::Sender<bool>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    adv_task: Mutex<Option<JoinHandle<()>>>,
    scan_failure: Mutex<Option<String>>,
    advertise_failure: Mutex<Option<String>>,
}

impl SimBleDevice {
    /// Get this device's BLE address.
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    /// The identifier scanners will see for this device.
    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.profile.name.write() = name;
    }

    pub fn set_local_name(&self, local_name: Option<String>) {
        *self.profile.local_name.write() = local_name;
    }

    /// Set the RSSI scanners will observe for this device's packets.
    pub fn set_rssi(&self, rssi: i16) {
        self.profile.rssi.store(rssi, Ordering::SeqCst);
    }

    /// Set the period between repeated packets while advertising.
    /// Uses tokio virtual time, so paused clocks advance instantly in tests.
    pub fn set_advertising_interval(&mut self, interval: Duration) {
        self.adv_interval = interval;
    }

    /// Make the next `start_scan` calls fail with the given reason.
    pub fn fail_scans(&self, reason: Option<String>) {
        *self.scan_failure.lock() = reason;
    }

    /// Make the next `start_advertising` calls fail with the given reason.
    pub fn fail_advertising(&self, reason: Option<String>) {
        *self.advertise_failure.lock() = reason;
    }

    /// Send a single packet without beacon data.
    pub fn announce(&self) {
        let _ = self.network.air_tx.send(self.profile.packet(Vec::new()));
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn is_advertising(&self) -> bool {
        self.adv_task.lock().is_some()
    }
}

impl Drop for SimBleDevice {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.adv_task.lock().take() {
            task.abort();
        }
    }
}

fn set_scan_state(state: &watch::Sender<bool>, running: bool) {
    state.send_if_modified(|current| std::mem::replace(current, running) != running);
}

/// Forward packets from the air to this device's subscribers until aborted
/// or the scan timeout elapses.
async fn forward_scan(
    mut air: broadcast::Receiver<RawAdvertisement>,
    scan_tx: broadcast::Sender<RawAdvertisement>,
    scan_state: Arc<watch::Sender<bool>>,
    own_id: String,
    allow_duplicates: bool,
    timeout: Option<Duration>,
) {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut seen = HashSet::new();
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, air.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    log::debug!("[sim] scan timeout reached for {}", own_id);
                    set_scan_state(&scan_state, false);
                    break;
                }
            },
            None => air.recv().await,
        };
        match next {
            Ok(adv) => {
                if adv.id == own_id {
                    continue;
                }
                if !allow_duplicates && !seen.insert(adv.id.clone()) {
                    continue;
                }
                let _ = scan_tx.send(adv);
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("[sim] scanner {} fell behind, {} packets lost", own_id, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl BleCentral for SimBleDevice {
    /// Service filters are ignored: simulated packets carry no service list.
    async fn start_scan(&self, options: &ScanOptions) -> Result<(), BleError> {
        let failure = self.scan_failure.lock().clone();
        if let Some(reason) = failure {
            return Err(BleError::ScanError(reason));
        }
        // Subscribe before returning so nothing sent afterwards is missed.
        let air = self.network.air_tx.subscribe();
        let timeout = (options.timeout_secs > 0).then(|| Duration::from_secs(options.timeout_secs));
        set_scan_state(&self.scan_state, true);
        let task = tokio::spawn(forward_scan(
            air,
            self.scan_tx.clone(),
            Arc::clone(&self.scan_state),
            self.profile.id.clone(),
            options.allow_duplicates,
            timeout,
        ));
        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        set_scan_state(&self.scan_state, false);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<RawAdvertisement> {
        self.scan_tx.subscribe()
    }

    fn scan_state(&self) -> watch::Receiver<bool> {
        self.scan_state.subscribe()
    }
}

#[async_trait]
impl BlePeripheral for SimBleDevice {
    async fn set_company_id(&self, company_id: u16) -> Result<(), BleError> {
        self.profile.company_id.store(company_id, Ordering::SeqCst);
        Ok(())
    }

    async fn start_advertising(&self, beacon: &BeaconParams) -> Result<(), BleError> {
        let failure = self.advertise_failure.lock().clone();
        if let Some(reason) = failure {
            return Err(BleError::AdvertisingError(reason));
        }
        let _ = self.network.air_tx.send(self.profile.beacon_packet(beacon));

        let profile = Arc::clone(&self.profile);
        let air_tx = self.network.air_tx.clone();
        let interval = self.adv_interval;
        let beacon = *beacon;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let _ = air_tx.send(profile.beacon_packet(&beacon));
            }
        });
        if let Some(previous) = self.adv_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        if let Some(task) = self.adv_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
