//! btleplug-backed BLE central
//!
//! Scans with the first system adapter and turns adapter events into
//! [`RawAdvertisement`]s. Advertising is not offered: btleplug has no
//! peripheral role.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::ibeacon::BeaconParams;
use super::transport::{BleAddress, BleCentral, BlePeripheral, RawAdvertisement, ScanOptions};
use super::BleError;

/// Per-scan duplicate filter; `None` when duplicates are allowed.
type SeenFilter = Arc<Mutex<Option<HashSet<String>>>>;

pub struct BtleCentral {
    adapter: Adapter,
    scan_tx: broadcast::Sender<RawAdvertisement>,
    seen: SeenFilter,
    scan_state: Arc<watch::Sender<bool>>,
    event_task: JoinHandle<()>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleCentral {
    /// Open the first Bluetooth adapter and start listening to its events.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::AdapterError(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::AdapterError(format!("Failed to get adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterError("No Bluetooth adapter found".to_string()))?;

        let mut events = adapter
            .events()
            .await
            .map_err(|e| BleError::AdapterError(e.to_string()))?;

        let (scan_tx, _) = broadcast::channel(256);
        let seen: SeenFilter = Arc::new(Mutex::new(None));

        let event_task = {
            let adapter = adapter.clone();
            let scan_tx = scan_tx.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                        _ => continue,
                    };
                    match read_advertisement(&adapter, &id).await {
                        Ok(Some(adv)) => {
                            if let Some(seen) = seen.lock().as_mut() {
                                if !seen.insert(adv.id.clone()) {
                                    continue;
                                }
                            }
                            let _ = scan_tx.send(adv);
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("[btle] failed to read peripheral {:?}: {}", id, e),
                    }
                }
                log::debug!("[btle] adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            scan_tx,
            seen,
            scan_state: Arc::new(watch::channel(false).0),
            event_task,
            timeout_task: Mutex::new(None),
        })
    }
}

impl Drop for BtleCentral {
    fn drop(&mut self) {
        self.event_task.abort();
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
    }
}

/// Build an advertisement from the peripheral's current properties.
async fn read_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<RawAdvertisement>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(props) = peripheral.properties().await? else {
        return Ok(None);
    };

    let mac = props.address.into_inner();
    let device_id = if mac == [0u8; 6] {
        // CoreBluetooth hides addresses; fall back to the platform identifier.
        format!("{:?}", id)
    } else {
        BleAddress::Real(mac).to_string()
    };

    Ok(Some(RawAdvertisement {
        id: device_id,
        name: props.local_name.clone(),
        rssi: props.rssi.unwrap_or_default(),
        manufacturer_data: flatten_manufacturer_data(&props.manufacturer_data),
        local_name: props.local_name,
    }))
}

/// Company id (little-endian) followed by its payload, ordered by company id.
fn flatten_manufacturer_data(data: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
    let mut companies: Vec<_> = data.iter().collect();
    companies.sort_by_key(|(company, _)| **company);
    let mut out = Vec::new();
    for (company, payload) in companies {
        out.extend_from_slice(&company.to_le_bytes());
        out.extend_from_slice(payload);
    }
    out
}

#[async_trait]
impl BleCentral for BtleCentral {
    async fn start_scan(&self, options: &ScanOptions) -> Result<(), BleError> {
        *self.seen.lock() = if options.allow_duplicates {
            None
        } else {
            Some(HashSet::new())
        };

        let filter = ScanFilter {
            services: options.service_uuids.clone(),
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        self.scan_state.send_replace(true);

        if options.timeout_secs > 0 {
            let adapter = self.adapter.clone();
            let scan_state = Arc::clone(&self.scan_state);
            let timeout = Duration::from_secs(options.timeout_secs);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                match adapter.stop_scan().await {
                    Ok(()) => {
                        log::debug!("[btle] scan timeout reached");
                        scan_state.send_replace(false);
                    }
                    Err(e) => log::error!("[btle] failed to stop scan after timeout: {}", e),
                }
            });
            if let Some(previous) = self.timeout_task.lock().replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(format!("Failed to stop scan: {}", e)))?;
        self.scan_state.send_replace(false);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<RawAdvertisement> {
        self.scan_tx.subscribe()
    }

    fn scan_state(&self) -> watch::Receiver<bool> {
        self.scan_state.subscribe()
    }
}

/// Stand-in peripheral role for adapters that cannot advertise.
pub struct NoPeripheral;

#[async_trait]
impl BlePeripheral for NoPeripheral {
    async fn set_company_id(&self, _company_id: u16) -> Result<(), BleError> {
        Err(BleError::Unsupported("advertising"))
    }

    async fn start_advertising(&self, _beacon: &BeaconParams) -> Result<(), BleError> {
        Err(BleError::Unsupported("advertising"))
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        Err(BleError::Unsupported("advertising"))
    }
}
