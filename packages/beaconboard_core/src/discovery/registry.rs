//! DiscoveryRegistry — one record per device, in first-seen order
//!
//! A device keeps the list position it got when it was first seen; later
//! packets from the same device replace its record in place. All mutation
//! happens under a single write lock, so a reader sees either the old or
//! the new record, never a mix, and updates to one device apply in the
//! order they were ingested.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::record::PeripheralRecord;
use super::DiscoveryError;
use crate::ble::transport::RawAdvertisement;

#[derive(Default)]
struct RegistryState {
    /// device id -> position in `records`.
    index: HashMap<String, usize>,
    records: Vec<PeripheralRecord>,
}

impl RegistryState {
    fn upsert(&mut self, record: PeripheralRecord) {
        match self.index.get(&record.id).copied() {
            Some(position) => self.records[position] = record,
            None => {
                self.index.insert(record.id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// The in-memory collection of the latest record per discovered device.
#[derive(Default)]
pub struct DiscoveryRegistry {
    state: RwLock<RegistryState>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every device. Called when a scan session starts.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.index.clear();
        state.records.clear();
    }

    /// Normalize one advertisement and insert or replace its device's record.
    ///
    /// On error the registry is left untouched.
    pub fn ingest(&self, raw: RawAdvertisement) -> Result<PeripheralRecord, DiscoveryError> {
        let record = PeripheralRecord::from_advertisement(raw)?;

        self.state.write().upsert(record.clone());
        Ok(record)
    }

    /// Replace the contents with previously saved records, keeping their order.
    pub fn restore(&self, records: Vec<PeripheralRecord>) {
        let mut state = self.state.write();
        state.index.clear();
        state.records.clear();
        for record in records {
            state.upsert(record);
        }
    }

    /// Current records in first-seen order.
    pub fn snapshot(&self) -> Vec<PeripheralRecord> {
        self.state.read().records.clone()
    }

    pub fn get(&self, id: &str) -> Option<PeripheralRecord> {
        let state = self.state.read();
        state.index.get(id).map(|&position| state.records[position].clone())
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
