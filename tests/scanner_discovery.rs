//! Scanner behavior against a scripted bus: plain discovery, the
//! factory-default renumber handshake, and the abandonment paths.

mod common;

use redflow_bridge::config::SETTING_AUTO_SCAN;
use redflow_bridge::protocol::{ClientId, FunctionCode};
use redflow_bridge::scanner::{DeviceScanner, ScanStatus, ScannerCommand, ScannerEvent};
use redflow_bridge::tree::{self, NodeId, SharedTree};

use common::MockBus;
use common::MockDevice;

struct Harness {
    scanner: DeviceScanner,
    events: flume::Receiver<ScannerEvent>,
    commands: flume::Sender<ScannerCommand>,
    log: common::RequestLog,
    bus: MockBus,
    _tree: SharedTree,
}

fn harness(bus: MockBus) -> Harness {
    let (arbiter, log) = common::start_bus(bus.handler());
    let (events_tx, events_rx) = flume::unbounded();
    let (commands_tx, commands_rx) = flume::unbounded();
    let tree = tree::shared();
    let autoscan: NodeId = tree.write().get_or_create(SETTING_AUTO_SCAN);
    let status = std::sync::Arc::new(parking_lot::RwLock::new(ScanStatus::default()));
    let scanner = DeviceScanner::new(
        arbiter.client(ClientId::Scanner),
        events_tx,
        commands_rx,
        tree.clone(),
        autoscan,
        status,
    );
    Harness {
        scanner,
        events: events_rx,
        commands: commands_tx,
        log,
        bus,
        _tree: tree,
    }
}

/// Probe until an event shows up or the probe budget runs out.
async fn probe_until_event(harness: &mut Harness, budget: usize) -> Option<ScannerEvent> {
    for _ in 0..budget {
        harness.scanner.probe().await.unwrap();
        if let Ok(event) = harness.events.try_recv() {
            return Some(event);
        }
    }
    None
}

#[tokio::test]
async fn plain_discovery_announces_device() {
    let mut harness = harness(MockBus::new(vec![MockDevice::new(4, 600001)]));
    harness.scanner.set_scan_cursor(2);

    let event = probe_until_event(&mut harness, 10).await;
    assert_eq!(event, Some(ScannerEvent::DeviceFound(4)));
    assert!(harness.scanner.known_addresses().contains(&4));
}

// A device still at factory default 1 is probed, a free candidate above the
// highest seen address is verified silent, the address register is written,
// and only then is the device announced at its new home.
#[tokio::test]
async fn factory_default_is_renumbered_before_announcement() {
    let mut harness = harness(MockBus::new(vec![MockDevice::new(1, 600002)]));
    harness.scanner.restore(&[2], 4);
    harness.scanner.set_scan_cursor(3);

    let event = probe_until_event(&mut harness, 600).await;
    assert_eq!(event, Some(ScannerEvent::DeviceFound(5)));
    assert_eq!(
        harness.scanner.known_addresses().iter().copied().collect::<Vec<_>>(),
        vec![2, 5]
    );
    assert!(!harness.scanner.renumber_in_progress());
    // The device really moved.
    assert_eq!(harness.bus.addresses(), vec![5]);

    let log = harness.log.lock();
    let write_index = log
        .iter()
        .position(|(_, r)| r.function == FunctionCode::WriteSingleRegister)
        .expect("renumber write missing");
    let (_, write) = &log[write_index];
    assert_eq!(write.slave, 1);
    assert_eq!(write.start_register, 0x9030);
    assert_eq!(write.count_or_value, 5);
    // The candidate was verified silent before the write went out.
    let probed_candidate = log[..write_index]
        .iter()
        .any(|(_, r)| r.function == FunctionCode::ReadHoldingRegisters && r.slave == 5);
    assert!(probed_candidate);
    // Factory defaults never become known addresses.
    assert!(!harness.scanner.known_addresses().contains(&1));
    assert!(!harness.scanner.known_addresses().contains(&99));
}

// A squatter answering at the intended new address pushes the handshake to
// the next candidate; the squatter itself is not announced by the handshake.
#[tokio::test]
async fn occupied_candidate_moves_to_next() {
    let mut harness = harness(MockBus::new(vec![
        MockDevice::new(1, 600003),
        MockDevice::new(5, 600004),
    ]));
    harness.scanner.restore(&[2], 4);
    // Start the sweep near the top so it wraps to the factory default before
    // the cursor happens upon the squatter.
    harness.scanner.set_scan_cursor(250);

    let event = probe_until_event(&mut harness, 600).await;
    assert_eq!(event, Some(ScannerEvent::DeviceFound(6)));
    assert!(!harness.scanner.known_addresses().contains(&5));

    let mut addresses = harness.bus.addresses();
    addresses.sort_unstable();
    assert_eq!(addresses, vec![5, 6]);
}

// A failed address write releases the handshake so scanning continues.
#[tokio::test]
async fn failed_renumber_write_is_abandoned() {
    let mut device = MockDevice::new(1, 600005);
    device.reject_address_writes = true;
    let mut harness = harness(MockBus::new(vec![device]));
    harness.scanner.set_scan_cursor(250);

    // Budget below a full sweep so the handshake is attempted exactly once.
    let event = probe_until_event(&mut harness, 200).await;
    assert_eq!(event, None);
    assert!(!harness.scanner.renumber_in_progress());
    assert!(harness.scanner.known_addresses().is_empty());

    let log = harness.log.lock();
    let writes = log
        .iter()
        .filter(|(_, r)| r.function == FunctionCode::WriteSingleRegister)
        .count();
    assert_eq!(writes, 1);
    // The sweep kept moving after the abandoned handshake.
    let last = log.last().unwrap();
    assert_eq!(last.1.function, FunctionCode::ReadHoldingRegisters);
}

// An externally renumbered device (address written through the object tree)
// keeps the scanner's bookkeeping in sync.
#[tokio::test]
async fn external_address_change_updates_known_addresses() {
    let mut harness = harness(MockBus::new(vec![MockDevice::new(4, 600009)]));
    harness.scanner.set_scan_cursor(2);

    let event = probe_until_event(&mut harness, 10).await;
    assert_eq!(event, Some(ScannerEvent::DeviceFound(4)));

    harness
        .commands
        .send(ScannerCommand::AddressChanged { old: 4, new: 11 })
        .unwrap();
    harness.scanner.probe().await.unwrap();

    assert!(!harness.scanner.known_addresses().contains(&4));
    assert!(harness.scanner.known_addresses().contains(&11));
}

// No two confirmed devices end up sharing an address over a whole sweep.
#[tokio::test]
async fn discovered_addresses_stay_unique() {
    let mut harness = harness(MockBus::new(vec![
        MockDevice::new(1, 600006),
        MockDevice::new(7, 600007),
        MockDevice::new(12, 600008),
    ]));
    harness.scanner.set_scan_cursor(2);

    let mut found = Vec::new();
    for _ in 0..2000 {
        harness.scanner.probe().await.unwrap();
        while let Ok(ScannerEvent::DeviceFound(address)) = harness.events.try_recv() {
            found.push(address);
        }
        if found.len() == 3 {
            break;
        }
    }
    assert_eq!(found.len(), 3, "expected all three devices to be found");
    let mut unique = found.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 3);
    assert!(found.iter().all(|a| *a != 1 && *a != 99));
}
