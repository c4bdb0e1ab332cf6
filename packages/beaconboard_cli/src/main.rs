//! Beaconboard CLI
//!
//! Drives a board over the simulated BLE network (or a real adapter with
//! `--features ble-central`) and replays recorded scan events.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beaconboard")]
#[command(about = "BLE beacon board - advertise, scan, and list peripherals", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides applied on top of the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct BoardArgs {
    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Company identifier, hex (e.g. 0x00E0)
    #[arg(long)]
    pub company_id: Option<String>,

    /// Beacon proximity UUID
    #[arg(long)]
    pub uuid: Option<uuid::Uuid>,

    /// Beacon major, hex (e.g. 1234)
    #[arg(long)]
    pub major: Option<String>,

    /// Beacon minor, hex (e.g. 4321)
    #[arg(long)]
    pub minor: Option<String>,

    /// Report only the first packet per device
    #[arg(long)]
    pub no_duplicates: bool,

    /// Stop scanning after this many seconds (0 = until stopped)
    #[arg(long)]
    pub scan_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a simulated neighbourhood of beacons and named tags
    Demo {
        #[command(flatten)]
        board: BoardArgs,

        /// Number of simulated beacons
        #[arg(long, default_value_t = 3)]
        beacons: usize,

        /// Number of simulated named tags
        #[arg(long, default_value_t = 2)]
        tags: usize,

        /// How long to scan, in seconds
        #[arg(long, default_value_t = 5)]
        duration: u64,
    },

    /// Advertise the configured beacon and show what a second board sees
    Advertise {
        #[command(flatten)]
        board: BoardArgs,

        /// How long to advertise, in seconds
        #[arg(long, default_value_t = 3)]
        duration: u64,
    },

    /// Feed recorded advertisements (one JSON object per line) into a registry
    Replay {
        /// JSON-lines file, or - for stdin
        file: PathBuf,

        /// Print the snapshot as JSON instead of the board
        #[arg(long)]
        json: bool,
    },

    /// Scan with the system Bluetooth adapter
    #[cfg(feature = "ble-central")]
    Scan {
        #[command(flatten)]
        board: BoardArgs,

        /// How long to scan, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            board,
            beacons,
            tags,
            duration,
        } => commands::demo(board, beacons, tags, duration).await,
        Commands::Advertise { board, duration } => commands::advertise(board, duration).await,
        Commands::Replay { file, json } => commands::replay(file, json),
        #[cfg(feature = "ble-central")]
        Commands::Scan { board, duration } => commands::scan(board, duration).await,
    }
}
