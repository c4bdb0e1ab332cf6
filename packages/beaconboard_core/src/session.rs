//! SessionController — the board's scan/advertise state
//!
//! Owns the discovery registry for the lifetime of the board, wires the
//! four controls (start/stop advertising, start/stop scanning) to the
//! capability provider, and runs the listener task that feeds provider
//! events into the registry.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ble::transport::{BleCentral, BlePeripheral, RawAdvertisement};
use crate::ble::BleError;
use crate::config::BoardConfig;
use crate::discovery::DiscoveryRegistry;
use crate::permissions::{Action, PermissionError, PermissionGate};

/// One of the board's four buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    StartAdvertising,
    StopAdvertising,
    StartScanning,
    StopScanning,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Control::StartAdvertising => "Start advertising",
            Control::StopAdvertising => "Stop advertising",
            Control::StartScanning => "Start scanning",
            Control::StopScanning => "Stop scanning",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0} is not available right now")]
    ActionUnavailable(Control),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("BLE error: {0}")]
    Ble(#[from] BleError),
}

/// What the presentation layer needs to draw the controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub is_advertising: bool,
    pub is_scanning: bool,
    pub start_advertising: bool,
    pub stop_advertising: bool,
    pub start_scanning: bool,
    pub stop_scanning: bool,
    pub scan_denied: bool,
    pub advertise_denied: bool,
}

impl Controls {
    pub fn is_enabled(&self, control: Control) -> bool {
        match control {
            Control::StartAdvertising => self.start_advertising,
            Control::StopAdvertising => self.stop_advertising,
            Control::StartScanning => self.start_scanning,
            Control::StopScanning => self.stop_scanning,
        }
    }
}

#[derive(Debug, Default)]
struct SessionFlags {
    advertising: bool,
    scanning: bool,
    denied: HashSet<Action>,
}

impl SessionFlags {
    fn controls(&self) -> Controls {
        let idle = !self.advertising && !self.scanning;
        let scan_denied = self.denied.contains(&Action::Scan);
        let advertise_denied = self.denied.contains(&Action::Advertise);
        Controls {
            is_advertising: self.advertising,
            is_scanning: self.scanning,
            start_advertising: idle && !advertise_denied,
            stop_advertising: self.advertising,
            start_scanning: idle && !scan_denied,
            stop_scanning: self.scanning,
            scan_denied,
            advertise_denied,
        }
    }
}

pub struct SessionController {
    registry: Arc<DiscoveryRegistry>,
    central: Arc<dyn BleCentral>,
    peripheral: Arc<dyn BlePeripheral>,
    gate: PermissionGate,
    config: BoardConfig,
    flags: Arc<RwLock<SessionFlags>>,
    /// Serializes control operations so check-then-act spans the await.
    ops: Arc<tokio::sync::Mutex<()>>,
    /// Bumped whenever the rendered board may have changed.
    changes_tx: Arc<watch::Sender<u64>>,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(
        central: Arc<dyn BleCentral>,
        peripheral: Arc<dyn BlePeripheral>,
        gate: PermissionGate,
        config: BoardConfig,
    ) -> Self {
        let (changes_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry: Arc::new(DiscoveryRegistry::new()),
            central,
            peripheral,
            gate,
            config,
            flags: Arc::new(RwLock::new(SessionFlags::default())),
            ops: Arc::new(tokio::sync::Mutex::new(())),
            changes_tx: Arc::new(changes_tx),
            shutdown_tx,
            listener: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn controls(&self) -> Controls {
        self.flags.read().controls()
    }

    /// Redraw tick: changes whenever the registry or the controls change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes_tx.subscribe()
    }

    /// Start feeding provider events into the registry and following the
    /// provider's scan state. Replaces any listener already running.
    pub fn attach(&self) {
        self.detach();

        // Subscribe before spawning so no event after attach() is missed.
        let mut rx = self.central.advertisements();
        let mut scan_state = self.central.scan_state();
        scan_state.borrow_and_update();
        let mut shutdown = self.shutdown_tx.subscribe();
        let registry = Arc::clone(&self.registry);
        let flags = Arc::clone(&self.flags);
        let changes_tx = Arc::clone(&self.changes_tx);
        let ops = Arc::clone(&self.ops);

        let task = tokio::spawn(async move {
            let mut scan_state_open = true;
            loop {
                tokio::select! {
                    result = rx.recv() => match result {
                        Ok(adv) => handle_advertisement(&registry, &flags, &changes_tx, adv),
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("[session] listener fell behind, {} advertisements skipped", skipped);
                        }
                        Err(RecvError::Closed) => {
                            log::debug!("[session] advertisement stream closed");
                            break;
                        }
                    },
                    changed = scan_state.changed(), if scan_state_open => match changed {
                        Ok(()) => {
                            let running = *scan_state.borrow_and_update();
                            if !running {
                                end_provider_scan(&ops, &scan_state, &flags, &changes_tx).await;
                            }
                        }
                        Err(_) => scan_state_open = false,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
        *self.listener.lock() = Some(task);
    }

    /// Stop the listener task, if any.
    pub fn detach(&self) {
        if self.listener.lock().take().is_some() {
            log::debug!("[session] removing advertisement listener");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Clear recorded permission refusals so the user can try again.
    pub fn clear_permission_denials(&self) {
        self.flags.write().denied.clear();
        self.notify();
    }

    pub async fn start_scanning(&self) -> Result<(), SessionError> {
        let _op = self.ops.lock().await;
        self.require(Control::StartScanning)?;
        self.check_permission(Action::Scan).await?;

        // The provider may deliver events before start_scan returns.
        let previous = self.registry.snapshot();
        self.registry.reset();
        self.flags.write().scanning = true;
        self.notify();

        if let Err(e) = self.central.start_scan(&self.config.scan).await {
            log::error!("[session] scan failed to start: {}", e);
            self.flags.write().scanning = false;
            self.registry.restore(previous);
            self.notify();
            return Err(e.into());
        }
        log::info!("[session] scanning started");
        Ok(())
    }

    pub async fn stop_scanning(&self) -> Result<(), SessionError> {
        let _op = self.ops.lock().await;
        self.require(Control::StopScanning)?;

        if let Err(e) = self.central.stop_scan().await {
            log::error!("[session] scan failed to stop: {}", e);
            return Err(e.into());
        }

        self.flags.write().scanning = false;
        self.notify();
        log::info!("[session] scanning stopped");
        Ok(())
    }

    pub async fn start_advertising(&self) -> Result<(), SessionError> {
        let _op = self.ops.lock().await;
        self.require(Control::StartAdvertising)?;
        self.check_permission(Action::Advertise).await?;

        self.peripheral.set_company_id(self.config.company_id).await?;
        self.flags.write().advertising = true;
        self.notify();

        if let Err(e) = self.peripheral.start_advertising(&self.config.beacon).await {
            log::error!("[session] advertising failed to start: {}", e);
            self.flags.write().advertising = false;
            self.notify();
            return Err(e.into());
        }
        log::info!(
            "[session] advertising {} major={:#06x} minor={:#06x}",
            self.config.beacon.uuid,
            self.config.beacon.major,
            self.config.beacon.minor
        );
        Ok(())
    }

    pub async fn stop_advertising(&self) -> Result<(), SessionError> {
        let _op = self.ops.lock().await;
        self.require(Control::StopAdvertising)?;

        self.flags.write().advertising = false;
        self.notify();

        if let Err(e) = self.peripheral.stop_advertising().await {
            log::error!("[session] advertising failed to stop: {}", e);
            self.flags.write().advertising = true;
            self.notify();
            return Err(e.into());
        }
        log::info!("[session] advertising stopped");
        Ok(())
    }

    fn require(&self, control: Control) -> Result<(), SessionError> {
        if self.controls().is_enabled(control) {
            Ok(())
        } else {
            log::warn!("[session] ignoring {}: control disabled", control);
            Err(SessionError::ActionUnavailable(control))
        }
    }

    async fn check_permission(&self, action: Action) -> Result<(), SessionError> {
        match self.gate.ensure(action).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, PermissionError::Denied { .. }) {
                    self.flags.write().denied.insert(action);
                    self.notify();
                }
                Err(e.into())
            }
        }
    }

    fn notify(&self) {
        self.changes_tx.send_modify(|version| *version += 1);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn handle_advertisement(
    registry: &DiscoveryRegistry,
    flags: &RwLock<SessionFlags>,
    changes_tx: &watch::Sender<u64>,
    adv: RawAdvertisement,
) {
    if !flags.read().scanning {
        log::debug!("[session] ignoring advertisement from {} outside a scan", adv.id);
        return;
    }
    log::debug!("[session] discovered peripheral {} rssi={}", adv.id, adv.rssi);
    match registry.ingest(adv) {
        Ok(_) => changes_tx.send_modify(|version| *version += 1),
        Err(e) => log::warn!("[session] dropping advertisement: {}", e),
    }
}

/// Clear the scanning flag after the provider ended a scan by itself.
async fn end_provider_scan(
    ops: &tokio::sync::Mutex<()>,
    scan_state: &watch::Receiver<bool>,
    flags: &RwLock<SessionFlags>,
    changes_tx: &watch::Sender<u64>,
) {
    let _op = ops.lock().await;
    // A start_scanning that ran while we waited may have restarted the radio.
    if *scan_state.borrow() {
        return;
    }
    let was_scanning = std::mem::replace(&mut flags.write().scanning, false);
    if was_scanning {
        changes_tx.send_modify(|version| *version += 1);
        log::info!("[session] scan ended by the provider");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::ble::ibeacon::BeaconParams;
    use crate::ble::simulated::{SimBleDevice, SimBleNetwork};
    use crate::ble::transport::ScanOptions;
    use crate::permissions::{Permission, Platform, StaticPermissions};

    /// Scripted radio: sends `during_start` from inside `start_scan`, and
    /// can refuse to stop advertising.
    struct ScriptedRadio {
        scan_tx: broadcast::Sender<RawAdvertisement>,
        scan_state: watch::Sender<bool>,
        during_start: Vec<RawAdvertisement>,
        stop_advertising_error: Option<String>,
    }

    impl ScriptedRadio {
        fn new(during_start: Vec<RawAdvertisement>) -> Self {
            Self {
                scan_tx: broadcast::channel(16).0,
                scan_state: watch::channel(false).0,
                during_start,
                stop_advertising_error: None,
            }
        }
    }

    #[async_trait]
    impl BleCentral for ScriptedRadio {
        async fn start_scan(&self, _options: &ScanOptions) -> Result<(), BleError> {
            for adv in &self.during_start {
                let _ = self.scan_tx.send(adv.clone());
            }
            tokio::task::yield_now().await;
            self.scan_state.send_replace(true);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), BleError> {
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

    #[async_trait]
    impl BlePeripheral for ScriptedRadio {
        async fn set_company_id(&self, _company_id: u16) -> Result<(), BleError> {
            Ok(())
        }

        async fn start_advertising(&self, _beacon: &BeaconParams) -> Result<(), BleError> {
            Ok(())
        }

        async fn stop_advertising(&self) -> Result<(), BleError> {
            match &self.stop_advertising_error {
                Some(reason) => Err(BleError::AdvertisingError(reason.clone())),
                None => Ok(()),
            }
        }
    }

    fn scripted_controller(radio: ScriptedRadio) -> SessionController {
        let radio = Arc::new(radio);
        let gate = PermissionGate::new(Platform::Desktop, Arc::new(StaticPermissions::none()));
        SessionController::new(radio.clone(), radio, gate, BoardConfig::default())
    }

    fn controller_with(
        network: &Arc<SimBleNetwork>,
        platform: Platform,
        permissions: StaticPermissions,
    ) -> (SessionController, Arc<SimBleDevice>) {
        let device = Arc::new(network.create_device());
        let gate = PermissionGate::new(platform, Arc::new(permissions));
        let controller = SessionController::new(
            device.clone(),
            device.clone(),
            gate,
            BoardConfig::default(),
        );
        (controller, device)
    }

    fn controller(network: &Arc<SimBleNetwork>) -> (SessionController, Arc<SimBleDevice>) {
        controller_with(network, Platform::Desktop, StaticPermissions::none())
    }

    fn controller_with_config(
        network: &Arc<SimBleNetwork>,
        config: BoardConfig,
    ) -> (SessionController, Arc<SimBleDevice>) {
        let device = Arc::new(network.create_device());
        let gate = PermissionGate::new(Platform::Desktop, Arc::new(StaticPermissions::none()));
        let controller = SessionController::new(device.clone(), device.clone(), gate, config);
        (controller, device)
    }

    #[test]
    fn test_initial_controls() {
        let flags = SessionFlags::default();
        let controls = flags.controls();
        assert!(controls.start_advertising);
        assert!(!controls.stop_advertising);
        assert!(controls.start_scanning);
        assert!(!controls.stop_scanning);
    }

    #[test]
    fn test_controls_while_busy() {
        let scanning = SessionFlags {
            scanning: true,
            ..SessionFlags::default()
        }
        .controls();
        assert!(!scanning.start_advertising);
        assert!(!scanning.start_scanning);
        assert!(scanning.stop_scanning);
        assert!(!scanning.stop_advertising);

        let advertising = SessionFlags {
            advertising: true,
            ..SessionFlags::default()
        }
        .controls();
        assert!(!advertising.start_advertising);
        assert!(!advertising.start_scanning);
        assert!(advertising.stop_advertising);
        assert!(!advertising.stop_scanning);
    }

    #[tokio::test]
    async fn test_scan_start_stop_toggles_flags() {
        let network = SimBleNetwork::new();
        let (controller, device) = controller(&network);

        controller.start_scanning().await.unwrap();
        assert!(controller.controls().is_scanning);
        assert!(device.is_scanning());

        controller.stop_scanning().await.unwrap();
        assert!(!controller.controls().is_scanning);
        assert!(!device.is_scanning());
    }

    #[tokio::test]
    async fn test_disabled_control_is_rejected() {
        let network = SimBleNetwork::new();
        let (controller, _device) = controller(&network);

        assert!(matches!(
            controller.stop_scanning().await,
            Err(SessionError::ActionUnavailable(Control::StopScanning))
        ));

        controller.start_scanning().await.unwrap();
        assert!(matches!(
            controller.start_scanning().await,
            Err(SessionError::ActionUnavailable(Control::StartScanning))
        ));
        assert!(matches!(
            controller.start_advertising().await,
            Err(SessionError::ActionUnavailable(Control::StartAdvertising))
        ));
    }

    #[tokio::test]
    async fn test_listener_ingests_only_while_scanning() {
        let network = SimBleNetwork::new();
        let (controller, _device) = controller(&network);
        controller.attach();
        let mut changes = controller.changes();

        controller.start_scanning().await.unwrap();
        changes.borrow_and_update();

        network.inject(RawAdvertisement::new("A", -40));
        changes.changed().await.unwrap();
        assert_eq!(controller.registry().len(), 1);

        controller.stop_scanning().await.unwrap();
        // The stopped scanner no longer forwards anything.
        network.inject(RawAdvertisement::new("B", -40));
        tokio::task::yield_now().await;
        assert_eq!(controller.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_event_is_dropped() {
        let network = SimBleNetwork::new();
        let (controller, _device) = controller(&network);
        controller.attach();
        let mut changes = controller.changes();

        controller.start_scanning().await.unwrap();
        changes.borrow_and_update();

        network.inject(RawAdvertisement::new("", -40));
        network.inject(RawAdvertisement::new("A", -40));
        changes.changed().await.unwrap();

        let snapshot = controller.registry().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "A");
    }

    #[tokio::test]
    async fn test_new_scan_clears_previous_results() {
        let network = SimBleNetwork::new();
        let (controller, _device) = controller(&network);

        controller.start_scanning().await.unwrap();
        controller
            .registry()
            .ingest(RawAdvertisement::new("old", -70))
            .unwrap();
        controller.stop_scanning().await.unwrap();
        assert_eq!(controller.registry().len(), 1);

        controller.start_scanning().await.unwrap();
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failed_scan_start_keeps_registry() {
        let network = SimBleNetwork::new();
        let (controller, device) = controller(&network);

        controller.start_scanning().await.unwrap();
        controller
            .registry()
            .ingest(RawAdvertisement::new("kept", -70))
            .unwrap();
        controller.stop_scanning().await.unwrap();

        device.fail_scans(Some("radio busy".to_string()));
        let result = controller.start_scanning().await;
        assert!(matches!(
            result,
            Err(SessionError::Ble(BleError::ScanError(_)))
        ));
        assert!(!controller.controls().is_scanning);
        assert_eq!(controller.registry().snapshot()[0].id, "kept");
    }

    #[tokio::test]
    async fn test_permission_denial_disables_control() {
        let network = SimBleNetwork::new();
        let (controller, device) = controller_with(
            &network,
            Platform::Android { api_level: 33 },
            StaticPermissions::granting([Permission::BluetoothAdvertise]),
        );

        let result = controller.start_scanning().await;
        assert!(matches!(
            result,
            Err(SessionError::Permission(PermissionError::Denied { action: Action::Scan, .. }))
        ));
        assert!(!device.is_scanning());

        let controls = controller.controls();
        assert!(controls.scan_denied);
        assert!(!controls.start_scanning);
        // Advertising is gated separately and still allowed.
        assert!(controls.start_advertising);

        // No automatic retry: the control stays disabled until cleared.
        assert!(matches!(
            controller.start_scanning().await,
            Err(SessionError::ActionUnavailable(Control::StartScanning))
        ));
        controller.clear_permission_denials();
        assert!(controller.controls().start_scanning);
    }

    #[tokio::test]
    async fn test_advertising_lifecycle() {
        let network = SimBleNetwork::new();
        let (controller, device) = controller(&network);

        controller.start_advertising().await.unwrap();
        assert!(controller.controls().is_advertising);
        assert!(device.is_advertising());
        assert!(!controller.controls().start_scanning);

        controller.stop_advertising().await.unwrap();
        assert!(!controller.controls().is_advertising);
        assert!(!device.is_advertising());
    }

    #[tokio::test]
    async fn test_failed_advertising_clears_flag() {
        let network = SimBleNetwork::new();
        let (controller, device) = controller(&network);
        device.fail_advertising(Some("unsupported".to_string()));

        let result = controller.start_advertising().await;
        assert!(matches!(
            result,
            Err(SessionError::Ble(BleError::AdvertisingError(_)))
        ));
        assert!(!controller.controls().is_advertising);
        assert!(controller.controls().start_advertising);
    }

    #[tokio::test]
    async fn test_detach_stops_listener() {
        let network = SimBleNetwork::new();
        let (controller, _device) = controller(&network);
        controller.attach();
        assert!(controller.is_attached());

        controller.start_scanning().await.unwrap();
        controller.detach();
        assert!(!controller.is_attached());
        tokio::task::yield_now().await;

        network.inject(RawAdvertisement::new("A", -40));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_events_delivered_while_scan_starts_are_kept() {
        let controller = scripted_controller(ScriptedRadio::new(vec![
            RawAdvertisement::new("early", -40),
        ]));
        controller.attach();

        controller.start_scanning().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while controller.registry().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("advertisement sent during start_scan was dropped");
        assert_eq!(controller.registry().snapshot()[0].id, "early");
        assert!(controller.controls().is_scanning);
    }

    #[tokio::test]
    async fn test_failed_scan_start_discards_events_from_the_attempt() {
        let network = SimBleNetwork::new();
        let (controller, device) = controller(&network);
        controller.attach();

        controller.start_scanning().await.unwrap();
        controller
            .registry()
            .ingest(RawAdvertisement::new("kept", -70))
            .unwrap();
        controller.stop_scanning().await.unwrap();

        device.fail_scans(Some("radio busy".to_string()));
        assert!(controller.start_scanning().await.is_err());
        network.inject(RawAdvertisement::new("stray", -40));
        tokio::task::yield_now().await;

        let ids: Vec<_> = controller
            .registry()
            .snapshot()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["kept".to_string()]);
        assert!(controller.controls().start_scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_returns_board_to_idle() {
        let network = SimBleNetwork::new();
        let mut config = BoardConfig::default();
        config.scan.timeout_secs = 2;
        let (controller, device) = controller_with_config(&network, config);
        controller.attach();
        let mut changes = controller.changes();

        controller.start_scanning().await.unwrap();
        changes.borrow_and_update();
        assert!(controller.controls().is_scanning);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!device.is_scanning());
        let controls = controller.controls();
        assert!(!controls.is_scanning);
        assert!(!controls.stop_scanning);
        assert!(controls.start_scanning);
        assert!(changes.has_changed().unwrap());

        // Results from the timed-out scan stay until the next one starts.
        controller.start_scanning().await.unwrap();
        assert!(controller.controls().is_scanning);
    }

    #[tokio::test]
    async fn test_manual_stop_is_not_reported_twice() {
        let network = SimBleNetwork::new();
        let (controller, _device) = controller(&network);
        controller.attach();

        controller.start_scanning().await.unwrap();
        controller.stop_scanning().await.unwrap();
        controller.start_scanning().await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        // The stale "stopped" state from the first scan must not end the second.
        assert!(controller.controls().is_scanning);
    }

    #[tokio::test]
    async fn test_failed_stop_advertising_keeps_flag() {
        let mut radio = ScriptedRadio::new(Vec::new());
        radio.stop_advertising_error = Some("controller busy".to_string());
        let controller = scripted_controller(radio);

        controller.start_advertising().await.unwrap();
        let result = controller.stop_advertising().await;
        assert!(matches!(
            result,
            Err(SessionError::Ble(BleError::AdvertisingError(_)))
        ));

        let controls = controller.controls();
        assert!(controls.is_advertising);
        assert!(controls.stop_advertising);
        assert!(!controls.start_scanning);
    }
}
