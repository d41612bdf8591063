//! Poller state machine against a scripted device: identification, cyclic
//! acquisition, write insertion, connection loss and recovery, and the
//! address-change restart.

mod common;

use std::time::Duration;

use tokio::time::Instant;

use redflow_bridge::device::{
    BatteryController, BatteryUpdater, ConnectionState, DeviceEvent, Measurements, WriteIntent,
};
use redflow_bridge::protocol::{ArbiterHandle, ClientId, FunctionCode, Request};

use common::{MockBus, MockDevice};

struct Harness {
    arbiter: ArbiterHandle,
    bus: MockBus,
    log: common::RequestLog,
    events_tx: flume::Sender<DeviceEvent>,
    events: flume::Receiver<DeviceEvent>,
}

fn harness(bus: MockBus) -> Harness {
    let (arbiter, log) = common::start_bus(bus.handler());
    let (events_tx, events_rx) = flume::unbounded();
    Harness {
        arbiter,
        bus,
        log,
        events_tx,
        events: events_rx,
    }
}

impl Harness {
    /// Spawn a poller for the given address; returns its intent queue.
    fn spawn_poller(&self, address: u8) -> flume::Sender<WriteIntent> {
        let (intents_tx, intents_rx) = flume::unbounded();
        let updater = BatteryUpdater::new(
            BatteryController::new("/dev/ttyUSB0", address),
            self.arbiter.client(ClientId::Poller(address)),
            self.events_tx.clone(),
            intents_rx,
        );
        tokio::spawn(updater.run());
        intents_tx
    }

    async fn wait_for<F>(&self, seen: &mut Vec<DeviceEvent>, pred: F) -> DeviceEvent
    where
        F: Fn(&DeviceEvent) -> bool,
    {
        loop {
            let event = self
                .events
                .recv_async()
                .await
                .expect("event channel closed while waiting");
            seen.push(event.clone());
            if pred(seen.last().unwrap()) {
                return seen.last().unwrap().clone();
            }
        }
    }
}

fn is_connected(event: &DeviceEvent) -> bool {
    matches!(
        event,
        DeviceEvent::ConnectionChanged {
            state: ConnectionState::Connected,
            ..
        }
    )
}

fn is_disconnected(event: &DeviceEvent) -> bool {
    matches!(
        event,
        DeviceEvent::ConnectionChanged {
            state: ConnectionState::Disconnected,
            ..
        }
    )
}

#[tokio::test(start_paused = true)]
async fn identification_runs_before_acquisition() {
    let harness = harness(MockBus::new(vec![MockDevice::new(7, 600006)]));
    let _intents = harness.spawn_poller(7);

    let mut seen = Vec::new();
    harness.wait_for(&mut seen, is_connected).await;

    let identified = seen
        .iter()
        .position(|e| matches!(e, DeviceEvent::Identified { .. }))
        .expect("no identification event");
    match &seen[identified] {
        DeviceEvent::Identified {
            address,
            serial,
            firmware_version,
            ..
        } => {
            assert_eq!(*address, 7);
            assert_eq!(serial, "600006");
            assert_eq!(*firmware_version, 0x0102);
        }
        _ => unreachable!(),
    }
    let detected = seen
        .iter()
        .position(|e| {
            matches!(
                e,
                DeviceEvent::ConnectionChanged {
                    state: ConnectionState::Detected,
                    ..
                }
            )
        })
        .expect("no detected transition");
    let first_values = seen
        .iter()
        .position(|e| matches!(e, DeviceEvent::MeasurementsUpdated { .. }))
        .expect("no measurement event");
    let connected = seen.iter().position(is_connected).unwrap();
    assert!(identified < detected);
    assert!(detected < first_values);
    // Connected only after a full measurement cycle has been published.
    assert!(first_values < connected);

    // Identification reads come in state-machine order on the wire.
    let registers: Vec<u16> = harness
        .log
        .lock()
        .iter()
        .take(3)
        .map(|(_, r)| r.start_register)
        .collect();
    assert_eq!(registers, vec![0x9010, 0x9018, 0x901A]);

    match seen.iter().find(|e| matches!(e, DeviceEvent::MeasurementsUpdated { .. })) {
        Some(DeviceEvent::MeasurementsUpdated { values, .. }) => {
            assert_eq!(values.soc, Some(0.80));
            assert_eq!(values.voltage, Some(20.0));
            assert_eq!(values.current, Some(-10.0));
            assert_eq!(values.battery_temperature, Some(24.5));
            assert_eq!(values.air_temperature, Some(22.5));
            assert_eq!(values.consumed_amphours, Some(600));
        }
        _ => unreachable!(),
    }
}

// Five consecutive timeouts mark the device lost; the poller then stays off
// the bus for 60 seconds and restarts identification at the same address.
#[tokio::test(start_paused = true)]
async fn connection_loss_backs_off_sixty_seconds() {
    let harness = harness(MockBus::new(vec![MockDevice::new(7, 600006)]));
    let _intents = harness.spawn_poller(7);

    let mut seen = Vec::new();
    harness.wait_for(&mut seen, is_connected).await;

    harness.bus.set_silent(7, true);
    harness.wait_for(&mut seen, is_disconnected).await;

    // Measurement values were cleared before the disconnect was signalled.
    let last_values = seen
        .iter()
        .rev()
        .find_map(|e| match e {
            DeviceEvent::MeasurementsUpdated { values, .. } => Some(values.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_values, Measurements::default());

    harness.bus.set_silent(7, false);
    harness
        .wait_for(&mut seen, |e| {
            matches!(e, DeviceEvent::Identified { address: 7, .. })
        })
        .await;

    // The request log shows a silent window of at least 60 seconds, and the
    // first request after it restarts identification at address 7.
    let log = harness.log.lock();
    let mut gap: Option<(Instant, Request)> = None;
    let mut previous: Option<Instant> = None;
    for (stamp, request) in log.iter() {
        if let Some(prev) = previous {
            if *stamp - prev >= Duration::from_secs(60) {
                gap = Some((*stamp, request.clone()));
            }
        }
        previous = Some(*stamp);
    }
    let (_, first_after) = gap.expect("no back-off window in the request log");
    assert_eq!(first_after, Request::read_holding_registers(7, 0x9010, 1));
}

// An external operational-mode write is issued as one WriteSingleRegister
// between composite reads, and a repeated identical write reaches the device
// again.
#[tokio::test(start_paused = true)]
async fn mode_write_is_inserted_between_composites_and_is_idempotent() {
    let harness = harness(MockBus::new(vec![MockDevice::new(7, 600006)]));
    let (intents_tx, intents_rx) = flume::unbounded();
    // Queue the write before the poller starts so it lands at the first
    // acquisition boundary.
    intents_tx.send(WriteIntent::OperationalMode(2)).unwrap();
    let updater = BatteryUpdater::new(
        BatteryController::new("/dev/ttyUSB0", 7),
        harness.arbiter.client(ClientId::Poller(7)),
        harness.events_tx.clone(),
        intents_rx,
    );
    tokio::spawn(updater.run());

    let mut seen = Vec::new();
    harness
        .wait_for(&mut seen, |e| {
            matches!(
                e,
                DeviceEvent::WriteApplied {
                    intent: WriteIntent::OperationalMode(2),
                    ..
                }
            )
        })
        .await;

    {
        let log = harness.log.lock();
        let writes: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, (_, r))| r.function == FunctionCode::WriteSingleRegister)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(writes.len(), 1);
        let (_, write) = &log[writes[0]];
        assert_eq!(write.slave, 7);
        assert_eq!(write.start_register, 0x9031);
        assert_eq!(write.count_or_value, 2);
        // Identification first, then the queued write, then the composites.
        assert_eq!(writes[0], 3);
    }

    // Same value again: one more WriteSingleRegister, no deduplication
    // against the device.
    intents_tx.send(WriteIntent::OperationalMode(2)).unwrap();
    harness
        .wait_for(&mut seen, |e| {
            matches!(
                e,
                DeviceEvent::WriteApplied {
                    intent: WriteIntent::OperationalMode(2),
                    ..
                }
            )
        })
        .await;
    let writes = harness
        .log
        .lock()
        .iter()
        .filter(|(_, r)| r.function == FunctionCode::WriteSingleRegister)
        .count();
    assert_eq!(writes, 2);
}

// Writing the device address renumbers the device, ends the old poller, and
// a fresh poller re-identifies at the new address.
#[tokio::test(start_paused = true)]
async fn address_write_restarts_identification_at_new_address() {
    let harness = harness(MockBus::new(vec![MockDevice::new(7, 600006)]));
    let intents = harness.spawn_poller(7);

    let mut seen = Vec::new();
    harness.wait_for(&mut seen, is_connected).await;

    intents.send(WriteIntent::DeviceAddress(11)).unwrap();
    harness
        .wait_for(&mut seen, |e| {
            matches!(e, DeviceEvent::AddressChanged { old: 7, new: 11 })
        })
        .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        DeviceEvent::WriteApplied {
            intent: WriteIntent::DeviceAddress(11),
            ..
        }
    )));
    assert_eq!(harness.bus.addresses(), vec![11]);

    let requests_before = harness.log.lock().len();
    let _intents_new = harness.spawn_poller(11);
    harness
        .wait_for(&mut seen, |e| {
            matches!(e, DeviceEvent::Identified { address: 11, .. })
        })
        .await;

    let log = harness.log.lock();
    // The old poller is gone: everything after the renumber targets slave 11.
    assert!(log[requests_before..].iter().all(|(_, r)| r.slave == 11));
    assert_eq!(log[requests_before].1.start_register, 0x9010);
    match seen.last().unwrap() {
        DeviceEvent::Identified { serial, .. } => assert_eq!(serial, "600006"),
        _ => unreachable!(),
    }
}

// An unsupported register block is remembered as unavailable; it neither
// counts toward connection loss nor gets polled again.
#[tokio::test(start_paused = true)]
async fn unsupported_register_block_is_latched() {
    let mut device = MockDevice::new(7, 600006);
    device.alarms_unsupported = true;
    let harness = harness(MockBus::new(vec![device]));
    let _intents = harness.spawn_poller(7);

    let mut seen = Vec::new();
    harness.wait_for(&mut seen, is_connected).await;
    for _ in 0..3 {
        harness
            .wait_for(&mut seen, |e| {
                matches!(e, DeviceEvent::MeasurementsUpdated { .. })
            })
            .await;
    }

    for event in &seen {
        if let DeviceEvent::MeasurementsUpdated { values, .. } = event {
            assert_eq!(values.warning_flags, None);
            assert_eq!(values.active_alarm_flags, None);
            assert!(values.soc.is_some());
        }
    }
    let alarm_reads = harness
        .log
        .lock()
        .iter()
        .filter(|(_, r)| r.start_register == 0x9024)
        .count();
    assert_eq!(alarm_reads, 1);
}
