use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use beaconboard::ble::ibeacon::BeaconParams;
use beaconboard::ble::simulated::{SimBleDevice, SimBleNetwork};
use beaconboard::ble::transport::BlePeripheral;
use beaconboard::config::parse_hex_u16;
use beaconboard::permissions::{PermissionGate, StaticPermissions};
use beaconboard::view::{render_board, render_records};
use beaconboard::{BoardConfig, DiscoveryRegistry, RawAdvertisement, SessionController};

use crate::BoardArgs;

/// Config file (if any) with command-line overrides applied.
fn load_config(args: &BoardArgs) -> Result<BoardConfig> {
    let mut config = match &args.config {
        Some(path) => BoardConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BoardConfig::default(),
    };
    if let Some(value) = &args.company_id {
        config.company_id = parse_hex_u16(value)?;
    }
    if let Some(uuid) = args.uuid {
        config.beacon.uuid = uuid;
    }
    if let Some(value) = &args.major {
        config.beacon.major = parse_hex_u16(value)?;
    }
    if let Some(value) = &args.minor {
        config.beacon.minor = parse_hex_u16(value)?;
    }
    if args.no_duplicates {
        config.scan.allow_duplicates = false;
    }
    if let Some(timeout) = args.scan_timeout {
        config.scan.timeout_secs = timeout;
    }
    Ok(config)
}

fn sim_board(network: &Arc<SimBleNetwork>, config: BoardConfig) -> SessionController {
    let device = Arc::new(network.create_device());
    let gate = PermissionGate::new(config.platform, Arc::new(StaticPermissions::all()));
    let controller = SessionController::new(device.clone(), device, gate, config);
    controller.attach();
    controller
}

fn print_board(controller: &SessionController) {
    println!(
        "\n=== {} ===",
        chrono::Local::now().format("%H:%M:%S%.3f")
    );
    print!(
        "{}",
        render_board(&controller.controls(), &controller.registry().snapshot())
    );
}

/// Redraw the board on changes until `duration` elapses or Ctrl-C.
/// `on_tick` runs on every redraw tick to let callers drive the simulation.
async fn watch_board<F>(controller: &SessionController, duration: u64, mut on_tick: F)
where
    F: FnMut(),
{
    let mut changes = controller.changes();
    let mut redraw = tokio::time::interval(Duration::from_millis(500));
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
            _ = redraw.tick() => {
                on_tick();
                if changes.has_changed().unwrap_or(false) {
                    changes.borrow_and_update();
                    print_board(controller);
                }
            }
        }
    }
}

pub async fn demo(args: BoardArgs, beacons: usize, tags: usize, duration: u64) -> Result<()> {
    let config = load_config(&args)?;
    let network = SimBleNetwork::new();
    let board = sim_board(&network, config);
    let mut rng = StdRng::from_entropy();

    let mut beacon_devices: Vec<SimBleDevice> = Vec::with_capacity(beacons);
    for i in 0..beacons {
        let mut device = network.create_device();
        device.set_advertising_interval(Duration::from_millis(rng.gen_range(100..400)));
        device.set_local_name(Some(format!("bcn-{}", i + 1)));
        device.set_rssi(rng.gen_range(-95..-40));
        let params = BeaconParams {
            major: rng.gen(),
            minor: rng.gen(),
            ..BeaconParams::default()
        };
        device.start_advertising(&params).await?;
        beacon_devices.push(device);
    }

    let tag_devices: Vec<SimBleDevice> = (0..tags)
        .map(|i| {
            let device = network.create_device();
            device.set_name(Some(format!("Tag {}", i + 1)));
            device
        })
        .collect();

    board.start_scanning().await?;
    print_board(&board);

    watch_board(&board, duration, || {
        for device in beacon_devices.iter().chain(tag_devices.iter()) {
            device.set_rssi(rng.gen_range(-95..-40));
        }
        for tag in &tag_devices {
            tag.announce();
        }
    })
    .await;

    board.stop_scanning().await?;
    for device in &beacon_devices {
        device.stop_advertising().await?;
    }
    print_board(&board);
    Ok(())
}

pub async fn advertise(args: BoardArgs, duration: u64) -> Result<()> {
    let config = load_config(&args)?;
    let network = SimBleNetwork::new();
    let advertiser = sim_board(&network, config);
    let scanner = sim_board(&network, BoardConfig::default());

    scanner.start_scanning().await?;
    advertiser.start_advertising().await?;
    print_board(&advertiser);

    watch_board(&scanner, duration, || {}).await;

    advertiser.stop_advertising().await?;
    scanner.stop_scanning().await?;
    print_board(&scanner);
    Ok(())
}

/// Counts from one replay run.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReplayStats {
    ingested: usize,
    dropped: usize,
}

/// Feed JSON-lines events into `registry`. Blank lines are skipped; lines
/// that fail to parse or ingest are logged and counted as dropped.
fn ingest_lines<R: BufRead>(reader: R, registry: &DiscoveryRegistry) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", n + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match RawAdvertisement::from_json(&line).and_then(|adv| registry.ingest(adv)) {
            Ok(_) => stats.ingested += 1,
            Err(e) => {
                log::warn!("line {}: {}", n + 1, e);
                stats.dropped += 1;
            }
        }
    }
    Ok(stats)
}

pub fn replay(file: PathBuf, json: bool) -> Result<()> {
    let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let f = std::fs::File::open(&file)
            .with_context(|| format!("opening {}", file.display()))?;
        Box::new(BufReader::new(f))
    };

    let registry = DiscoveryRegistry::new();
    let stats = ingest_lines(reader, &registry)?;

    let snapshot = registry.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_records(&snapshot));
    }
    eprintln!(
        "{} events ingested, {} dropped, {} peripherals",
        stats.ingested,
        stats.dropped,
        snapshot.len()
    );
    Ok(())
}

#[cfg(feature = "ble-central")]
pub async fn scan(args: BoardArgs, duration: u64) -> Result<()> {
    use beaconboard::ble::btle::{BtleCentral, NoPeripheral};

    let config = load_config(&args)?;
    let central = Arc::new(BtleCentral::new().await?);
    let gate = PermissionGate::new(config.platform, Arc::new(StaticPermissions::all()));
    let board = SessionController::new(central, Arc::new(NoPeripheral), gate, config);
    board.attach();

    board.start_scanning().await?;
    watch_board(&board, duration, || {}).await;
    board.stop_scanning().await?;
    print_board(&board);
    Ok(())
}
