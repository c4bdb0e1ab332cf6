//! Text rendering of the board
//!
//! One row per discovered peripheral, in registry order, under a header
//! showing the controls.

use std::fmt::Write;

use crate::ble::ibeacon::IBeacon;
use crate::discovery::PeripheralRecord;
use crate::session::{Control, Controls};

/// Shown in place of the list before anything has been discovered.
pub const EMPTY_LIST_MESSAGE: &str = "No Peripherals, press \"Scan Bluetooth\" above.";

/// The lines drawn for one peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRow {
    /// `"{display name} - {local name}"`.
    pub title: String,
    pub rssi: String,
    pub id: String,
    /// Manufacturer data, upper-cased after a `0x` prefix.
    pub raw_data: String,
    pub beacon: Option<String>,
}

impl From<&PeripheralRecord> for PeripheralRow {
    fn from(record: &PeripheralRecord) -> Self {
        let beacon = IBeacon::parse(&record.raw_data()).map(|b| {
            let mut line = format!(
                "iBeacon {} major={} minor={} tx={}",
                b.params.uuid, b.params.major, b.params.minor, b.params.tx_power
            );
            if let Some(company_id) = b.company_id {
                let _ = write!(line, " company={:#06x}", company_id);
            }
            line
        });

        Self {
            title: format!(
                "{} - {}",
                record.display_name,
                record.local_name.as_deref().unwrap_or("")
            ),
            rssi: format!("RSSI: {}", record.rssi),
            id: record.id.clone(),
            raw_data: format!("Raw data: 0x{}", record.raw_data_hex.to_uppercase()),
            beacon,
        }
    }
}

impl PeripheralRow {
    pub fn lines(&self) -> Vec<&str> {
        let mut lines = vec![
            self.title.as_str(),
            self.rssi.as_str(),
            self.id.as_str(),
            self.raw_data.as_str(),
        ];
        if let Some(beacon) = &self.beacon {
            lines.push(beacon);
        }
        lines
    }
}

fn control_label(controls: &Controls, control: Control) -> String {
    if controls.is_enabled(control) {
        format!("[{}]", control)
    } else {
        format!("({})", control)
    }
}

/// Render the whole board: controls, status, and the peripheral list.
pub fn render_board(controls: &Controls, records: &[PeripheralRecord]) -> String {
    let mut out = String::new();

    let buttons: Vec<String> = [
        Control::StartAdvertising,
        Control::StopAdvertising,
        Control::StartScanning,
        Control::StopScanning,
    ]
    .into_iter()
    .map(|control| control_label(controls, control))
    .collect();
    let _ = writeln!(out, "{}", buttons.join(" "));

    if controls.is_advertising {
        let _ = writeln!(out, "Advertising");
    }
    if controls.is_scanning {
        let _ = writeln!(out, "Scanning ({} peripherals)", records.len());
    }
    if controls.scan_denied {
        let _ = writeln!(out, "Scanning disabled: permission denied");
    }
    if controls.advertise_denied {
        let _ = writeln!(out, "Advertising disabled: permission denied");
    }

    out.push_str(&render_records(records));
    out
}

/// Render just the peripheral list.
pub fn render_records(records: &[PeripheralRecord]) -> String {
    let mut out = String::new();
    if records.is_empty() {
        let _ = writeln!(out, "{}", EMPTY_LIST_MESSAGE);
        return out;
    }

    for record in records {
        let _ = writeln!(out);
        for line in PeripheralRow::from(record).lines() {
            let _ = writeln!(out, "  {}", line);
        }
    }
    out
}
