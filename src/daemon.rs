//! Daemon wiring: one serial transport, one arbiter, one scanner, one poller
//! per discovered device, one shared object tree with per-device bridges and
//! the fleet summary.
//!
//! Everything runs on the current-thread runtime; only the transport uses a
//! worker thread for blocking serial IO. Serial failures arrive on the fatal
//! channel and end the daemon; with the only link gone there is nothing left
//! to do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;

use crate::config::{Config, SETTING_AUTO_SCAN};
use crate::device::{
    BatteryController, BatteryUpdater, ConnectionState, DeviceEvent, DeviceHandle, SharedRegistry,
    WriteIntent,
};
use crate::protocol::{ArbiterHandle, ClientId};
use crate::scanner::{DeviceScanner, ScanStatus, ScannerCommand, ScannerEvent};
use crate::tree::bridge::BridgeConfig;
use crate::tree::{
    BatteryBridge, BatterySummary, ItemWrite, Monitor, SharedTree, Value,
};
use crate::protocol::transport;
use crate::{serial, snapshot};

/// Summary refresh cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(config: Config) -> Result<()> {
    log::info!(
        "starting on {} at {} baud",
        config.port,
        config.baud_rate
    );
    let port = serial::open_serial_port(&config.port, config.baud_rate)?;

    let (fatal_tx, fatal_rx) = flume::unbounded();
    let jobs = transport::spawn(port, fatal_tx);
    let arbiter = ArbiterHandle::start(jobs);

    let tree: SharedTree = crate::tree::shared();
    let (scanner_events_tx, scanner_events_rx) = flume::unbounded();
    let (scanner_commands_tx, scanner_commands_rx) = flume::unbounded();
    let (device_events_tx, device_events_rx) = flume::unbounded();
    let (item_writes_tx, item_writes_rx) = flume::unbounded();
    let scan_status = Arc::new(RwLock::new(ScanStatus::default()));
    let registry: SharedRegistry = Arc::new(RwLock::new(Vec::new()));

    let (summary, autoscan) = {
        let mut tree = tree.write();
        let summary = BatterySummary::new(&mut tree);
        let autoscan = tree.get_or_create(SETTING_AUTO_SCAN);
        tree.set_value(autoscan, Value::Int(config.autoscan as i64));
        tree.set_writable(autoscan, true);
        (summary, autoscan)
    };

    let scanner = DeviceScanner::new(
        arbiter.client(ClientId::Scanner),
        scanner_events_tx,
        scanner_commands_rx,
        tree.clone(),
        autoscan,
        scan_status.clone(),
    );
    tokio::spawn(scanner.run());

    if let Some(path) = config.status_dump.clone() {
        tokio::spawn(snapshot::run(
            path,
            scan_status.clone(),
            registry.clone(),
            tree.clone(),
        ));
    }

    let mut daemon = Daemon {
        config,
        arbiter,
        tree,
        registry,
        scanner_commands: scanner_commands_tx,
        device_events: device_events_tx,
        item_writes: item_writes_tx,
        bridges: HashMap::new(),
        intent_channels: HashMap::new(),
        active_pollers: HashSet::new(),
        summary,
    };

    let mut monitor_tick = tokio::time::interval(MONITOR_INTERVAL);
    monitor_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = scanner_events_rx.recv_async() => {
                let event = event.map_err(|_| anyhow!("scanner stopped unexpectedly"))?;
                daemon.on_scanner_event(event);
            }
            event = device_events_rx.recv_async() => {
                let event = event.map_err(|_| anyhow!("device event channel closed"))?;
                daemon.on_device_event(event);
            }
            write = item_writes_rx.recv_async() => {
                let write = write.map_err(|_| anyhow!("item write channel closed"))?;
                daemon.on_item_write(write);
            }
            err = fatal_rx.recv_async() => {
                let err = err.map_err(|_| anyhow!("fatal channel closed"))?;
                return Err(err).context("serial subsystem failed");
            }
            _ = monitor_tick.tick() => {
                daemon.on_monitor_tick();
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                return Ok(());
            }
        }
    }
}

struct Daemon {
    config: Config,
    arbiter: ArbiterHandle,
    tree: SharedTree,
    registry: SharedRegistry,
    scanner_commands: flume::Sender<ScannerCommand>,
    device_events: flume::Sender<DeviceEvent>,
    item_writes: flume::Sender<ItemWrite>,
    bridges: HashMap<String, BatteryBridge>,
    intent_channels: HashMap<u8, flume::Sender<WriteIntent>>,
    active_pollers: HashSet<u8>,
    summary: BatterySummary,
}

impl Daemon {
    fn on_scanner_event(&mut self, event: ScannerEvent) {
        match event {
            ScannerEvent::DeviceFound(address) => self.spawn_poller(address),
        }
    }

    fn spawn_poller(&mut self, address: u8) {
        if self.active_pollers.contains(&address) {
            log::debug!("poller for address {address} already running");
            return;
        }
        let (intents_tx, intents_rx) = flume::unbounded();
        self.intent_channels.insert(address, intents_tx);
        self.active_pollers.insert(address);
        let controller = BatteryController::new(&self.config.port, address);
        let updater = BatteryUpdater::new(
            controller,
            self.arbiter.client(ClientId::Poller(address)),
            self.device_events.clone(),
            intents_rx,
        );
        tokio::spawn(updater.run());
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Identified {
                address,
                device_type,
                serial,
                firmware_version,
            } => self.on_identified(address, device_type, serial, firmware_version),
            DeviceEvent::ConnectionChanged { address, state } => {
                self.on_connection_changed(address, state)
            }
            DeviceEvent::MeasurementsUpdated { address, values } => {
                if let Some(bridge) = self.bridge_for_address(address) {
                    let tree = self.tree.clone();
                    bridge.apply_measurements(&mut tree.write(), &values);
                }
            }
            DeviceEvent::WriteApplied { address, intent } => {
                if let Some(bridge) = self.bridge_for_address(address) {
                    let tree = self.tree.clone();
                    bridge.apply_write(&mut tree.write(), &intent);
                }
            }
            DeviceEvent::AddressChanged { old, new } => self.on_address_changed(old, new),
        }
    }

    fn on_identified(&mut self, address: u8, device_type: u16, serial: String, firmware: u32) {
        let Some(intents) = self.intent_channels.get(&address).cloned() else {
            log::warn!("identified device at {address} without a poller");
            return;
        };
        let existing = self
            .registry
            .read()
            .iter()
            .position(|h| h.serial == serial);
        match existing {
            Some(index) => {
                // Known battery back after a reconnect or renumber; the mount
                // stays, only the routing data moves.
                let mut registry = self.registry.write();
                registry[index].address = address;
                registry[index].intents = intents;
                registry[index].connection = ConnectionState::Detected;
                drop(registry);
                if let Some(bridge) = self.bridges.get(&serial) {
                    bridge.set_device_address(&mut self.tree.write(), address);
                }
            }
            None => {
                log::info!("device found: {serial} @ {}", self.config.port);
                let mut tree = self.tree.write();
                let bridge = BatteryBridge::new(
                    &mut tree,
                    BridgeConfig {
                        port_name: &self.config.port,
                        serial: &serial,
                        address,
                        device_type,
                        firmware_version: firmware,
                        writes: self.item_writes.clone(),
                    },
                );
                let root = bridge.root();
                drop(tree);
                self.registry.write().push(DeviceHandle {
                    serial: serial.clone(),
                    address,
                    root,
                    connection: ConnectionState::Detected,
                    intents,
                });
                self.bridges.insert(serial, bridge);
            }
        }
    }

    fn on_connection_changed(&mut self, address: u8, state: ConnectionState) {
        {
            let mut registry = self.registry.write();
            if let Some(handle) = registry.iter_mut().find(|h| h.address == address) {
                handle.connection = state;
            }
        }
        if let Some(bridge) = self.bridge_for_address(address) {
            let tree = self.tree.clone();
            bridge.set_connection(&mut tree.write(), state);
        }
    }

    fn on_address_changed(&mut self, old: u8, new: u8) {
        self.active_pollers.remove(&old);
        self.intent_channels.remove(&old);
        let _ = self
            .scanner_commands
            .send(ScannerCommand::AddressChanged { old, new });
        {
            let mut registry = self.registry.write();
            if let Some(handle) = registry.iter_mut().find(|h| h.address == old) {
                handle.address = new;
            }
        }
        // Pending writes die with the old poller; a fresh one re-identifies
        // the device at its new address.
        self.spawn_poller(new);
    }

    fn on_item_write(&mut self, write: ItemWrite) {
        let Some((service, leaf)) = write.path.split_once('/') else {
            log::warn!("unroutable write on {}", write.path);
            return;
        };
        if leaf == "CustomName" {
            // An empty custom name falls back to the product name.
            let name = match &write.value {
                Value::Text(name) if !name.is_empty() => write.value.clone(),
                _ => Value::Text(crate::tree::bridge::PRODUCT_NAME.to_string()),
            };
            self.tree.write().set_value_notify(write.node, name);
            return;
        }
        let Some(value) = write.value.as_u16() else {
            log::warn!("non-integer write on {}", write.path);
            return;
        };
        let Some(intent) = intent_for(leaf, value) else {
            log::warn!("no command behind leaf {}", write.path);
            return;
        };
        let service_name = service.to_string();
        let registry = self.registry.read();
        let handle = registry
            .iter()
            .find(|h| BatteryBridge::service_name(&h.serial) == service_name);
        match handle {
            Some(handle) => {
                if handle.intents.send(intent).is_err() {
                    log::warn!("poller for {} is gone", handle.serial);
                }
            }
            None => log::warn!("write for unknown service {service_name}"),
        }
    }

    fn on_monitor_tick(&mut self) {
        let devices = self.registry.read().clone();
        self.summary.update_values(&mut self.tree.write(), &devices);
    }

    fn bridge_for_address(&self, address: u8) -> Option<&BatteryBridge> {
        let registry = self.registry.read();
        let serial = &registry.iter().find(|h| h.address == address)?.serial;
        self.bridges.get(serial)
    }
}

/// Map a command-leaf name to the write it queues on the poller.
fn intent_for(leaf: &str, value: u16) -> Option<WriteIntent> {
    match leaf {
        "OperationalMode" => Some(WriteIntent::OperationalMode(value)),
        "ClearStatusRegisterFlags" => Some(WriteIntent::ClearStatusFlags(value)),
        "RequestDelayedSelfMaintenance" => {
            Some(WriteIntent::RequestDelayedSelfMaintenance(value))
        }
        "RequestImmediateSelfMaintenance" => {
            Some(WriteIntent::RequestImmediateSelfMaintenance(value))
        }
        "DeviceAddress" => Some(WriteIntent::DeviceAddress(value)),
        _ => None,
    }
}
