//! Device scanner.
//!
//! Walks the address space probing the device-identifier register. A device
//! answering at a factory-default address (1 or 99) is moved to a free
//! permanent address first: the scanner picks a candidate above the highest
//! address seen so far, verifies it is silent, then writes the candidate into
//! the device's address register. Only then is the device announced. There is
//! no collision-resistant identification besides the address itself, so this
//! probe-then-write order is the only safe one.
//!
//! The scan cursor visits 1 and 99 on every sweep so hot-plugged units with
//! factory defaults are found; the candidate chooser never returns them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;

use crate::device::registers::{REG_DEVICE_ADDRESS, REG_DEVICE_ID};
use crate::protocol::{ArbiterClient, ResponseError};
use crate::tree::{NodeId, SharedTree, Value};

/// Inter-scan delay until the first device is confirmed.
pub const SCAN_INTERVAL_INITIAL: Duration = Duration::from_millis(250);
/// Relaxed delay once at least one device is on the bus.
pub const SCAN_INTERVAL_RELAXED: Duration = Duration::from_millis(2000);
/// Candidate retries before a renumber attempt is abandoned.
const RENUMBER_CANDIDATE_LIMIT: u8 = 8;
/// Idle delay while background scanning is disabled.
const AUTOSCAN_OFF_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerEvent {
    DeviceFound(u8),
}

/// Daemon-to-scanner notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerCommand {
    /// A poller renumbered its device via an external address write.
    AddressChanged { old: u8, new: u8 },
}

/// Observable scanner state, published for the status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStatus {
    pub probed_address: u8,
    pub auto_scan_address: u8,
    pub new_device_address: u8,
    pub max_address: u8,
    pub known_addresses: Vec<u8>,
    pub scan_interval_ms: u64,
}

pub struct DeviceScanner {
    client: ArbiterClient,
    events: flume::Sender<ScannerEvent>,
    commands: flume::Receiver<ScannerCommand>,
    tree: SharedTree,
    autoscan: NodeId,
    status: Arc<RwLock<ScanStatus>>,
    probed_address: u8,
    auto_scan_address: u8,
    /// Non-zero only while a renumber is in progress: the factory-default
    /// address whose occupant is being moved.
    new_device_address: u8,
    max_address: u8,
    known_addresses: BTreeSet<u8>,
    scan_interval: Duration,
    renumber_attempts: u8,
}

impl DeviceScanner {
    pub fn new(
        client: ArbiterClient,
        events: flume::Sender<ScannerEvent>,
        commands: flume::Receiver<ScannerCommand>,
        tree: SharedTree,
        autoscan: NodeId,
        status: Arc<RwLock<ScanStatus>>,
    ) -> Self {
        Self {
            client,
            events,
            commands,
            tree,
            autoscan,
            status,
            probed_address: 1,
            auto_scan_address: 1,
            new_device_address: 0,
            max_address: 1,
            known_addresses: BTreeSet::new(),
            scan_interval: SCAN_INTERVAL_INITIAL,
            renumber_attempts: 0,
        }
    }

    /// Seed the scanner with addresses assigned in an earlier run so they are
    /// neither re-probed nor handed out as renumber candidates.
    pub fn restore(&mut self, known_addresses: &[u8], max_address: u8) {
        self.known_addresses.extend(known_addresses.iter().copied());
        self.max_address = self.max_address.max(max_address);
        if !self.known_addresses.is_empty() {
            self.scan_interval = SCAN_INTERVAL_RELAXED;
        }
    }

    /// Point the cursor at a specific address for the next probe.
    pub fn set_scan_cursor(&mut self, address: u8) {
        self.auto_scan_address = address;
        self.probed_address = address;
    }

    pub fn known_addresses(&self) -> &BTreeSet<u8> {
        &self.known_addresses
    }

    pub fn renumber_in_progress(&self) -> bool {
        self.new_device_address != 0
    }

    pub async fn run(mut self) {
        loop {
            self.drain_commands();
            self.publish_status();
            if !self.autoscan_enabled() {
                tokio::time::sleep(AUTOSCAN_OFF_POLL).await;
                continue;
            }
            tokio::time::sleep(self.scan_interval).await;
            if self.probe().await.is_err() {
                log::debug!("scanner stopping, bus is gone");
                return;
            }
        }
    }

    /// Probe the current address once and advance the state machine.
    pub async fn probe(&mut self) -> Result<()> {
        self.drain_commands();
        let address = self.probed_address;
        log::debug!("scanning address {address}");
        let response = self
            .client
            .read_holding_registers(address, REG_DEVICE_ID, 1)
            .await?;
        match response.error {
            None => self.on_device_answered(),
            Some(ResponseError::Timeout) => self.on_probe_timeout().await?,
            Some(err) => {
                // Garbled reply: something is there, probe the same address
                // again next round.
                log::debug!("probe of {address} failed with {err:?}, retrying");
            }
        }
        Ok(())
    }

    fn on_device_answered(&mut self) {
        log::warn!("found device at address {}", self.probed_address);
        if self.probed_address == 1 || self.probed_address == 99 {
            // Factory default; move the device before announcing it.
            self.new_device_address = self.probed_address;
            self.renumber_attempts = 0;
            self.probed_address = self.next_free_address(self.max_address);
        } else if self.new_device_address != 0 {
            // Something unexpectedly answered at the intended new address;
            // try the next candidate, give up after a bounded number.
            self.renumber_attempts += 1;
            if self.renumber_attempts > RENUMBER_CANDIDATE_LIMIT {
                log::warn!(
                    "no free candidate found for device at {}, abandoning renumber",
                    self.new_device_address
                );
                self.new_device_address = 0;
                self.advance_cursor();
            } else {
                self.probed_address = self.next_free_address(self.probed_address);
            }
        } else {
            let address = self.probed_address;
            self.announce(address);
            self.advance_cursor();
        }
    }

    async fn on_probe_timeout(&mut self) -> Result<()> {
        if self.new_device_address != 0 {
            // The candidate is silent, so it is free: move the device there.
            let candidate = self.probed_address;
            log::warn!(
                "changing modbus address from {} to {candidate}",
                self.new_device_address
            );
            let response = self
                .client
                .write_single_register(self.new_device_address, REG_DEVICE_ADDRESS, candidate as u16)
                .await?;
            if response.is_ok() {
                self.new_device_address = 0;
                self.announce(candidate);
                // Resume the background sweep from the candidate.
                self.auto_scan_address = candidate;
                self.advance_cursor();
            } else {
                log::warn!(
                    "address write to device {} failed ({:?}), abandoning renumber",
                    self.new_device_address,
                    response.error
                );
                self.new_device_address = 0;
                self.advance_cursor();
            }
        } else {
            self.auto_scan_address = self.next_scan_address(self.probed_address);
            self.probed_address = self.auto_scan_address;
        }
        Ok(())
    }

    fn announce(&mut self, address: u8) {
        log::warn!("new device at address {address}");
        self.known_addresses.insert(address);
        self.max_address = self.max_address.max(address);
        self.scan_interval = SCAN_INTERVAL_RELAXED;
        let _ = self.events.send(ScannerEvent::DeviceFound(address));
    }

    fn advance_cursor(&mut self) {
        self.auto_scan_address = self.next_scan_address(self.auto_scan_address);
        self.probed_address = self.auto_scan_address;
    }

    /// Next address for the background sweep. Known addresses are skipped;
    /// 1 and 99 stay in the rotation so factory-default devices are found.
    fn next_scan_address(&self, address: u8) -> u8 {
        let mut a = address;
        loop {
            a = if a >= 254 { 1 } else { a + 1 };
            if !self.known_addresses.contains(&a) {
                return a;
            }
        }
    }

    /// Next candidate for permanent assignment, counting up from the highest
    /// address seen and skipping 1, 99 and every known address.
    fn next_free_address(&self, from: u8) -> u8 {
        let mut a = from;
        loop {
            a = if a >= 254 { 2 } else { a + 1 };
            if a != 1 && a != 99 && !self.known_addresses.contains(&a) {
                return a;
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ScannerCommand::AddressChanged { old, new } => {
                    self.known_addresses.remove(&old);
                    self.known_addresses.insert(new);
                    self.max_address = self.max_address.max(new);
                    log::info!("device moved from {old} to {new}");
                }
            }
        }
    }

    fn autoscan_enabled(&self) -> bool {
        let tree = self.tree.read();
        match tree.value(self.autoscan) {
            Some(Value::Int(v)) => *v != 0,
            _ => true,
        }
    }

    fn publish_status(&self) {
        *self.status.write() = ScanStatus {
            probed_address: self.probed_address,
            auto_scan_address: self.auto_scan_address,
            new_device_address: self.new_device_address,
            max_address: self.max_address,
            known_addresses: self.known_addresses.iter().copied().collect(),
            scan_interval_ms: self.scan_interval.as_millis() as u64,
        };
    }
}
