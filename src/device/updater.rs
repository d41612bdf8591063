//! Per-device poller.
//!
//! One updater task per confirmed device. It walks the identification states
//! once, then alternates between acquisition sweeps over the composite
//! command table and a make-up wait that keeps each cycle at 250 ms minimum.
//! External write intents are slotted in between composite reads, never
//! inside one. Five consecutive transport failures escalate to a 60 second
//! connection-lost back-off before identification restarts.

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::Instant;

use super::controller::{BatteryController, ConnectionState, Measurements};
use super::registers::{
    decode_fields, serial_from_registers, CompositeCommand, REG_CLEAR_STATUS_FLAGS,
    REG_DELAYED_SELF_MAINTENANCE, REG_DEVICE_ADDRESS, REG_DEVICE_ID, REG_FIRMWARE_VERSION,
    REG_IMMEDIATE_SELF_MAINTENANCE, REG_OPERATIONAL_MODE, REG_SERIAL, ZBM_COMMANDS,
};
use crate::protocol::{ArbiterClient, ExceptionCode, Response, ResponseError};

/// Consecutive transport failures before a device counts as lost.
pub const MAX_TIMEOUT_COUNT: u8 = 5;
/// Minimum duration of one full acquisition cycle.
pub const MIN_CYCLE: Duration = Duration::from_millis(250);
/// Back-off before rediscovery after a lost connection.
pub const CONNECTION_LOST_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    DeviceId,
    Serial,
    FirmwareVersion,
    WaitForStart,
    Acquisition,
    Wait,
    WaitOnConnectionLost,
}

/// A queued external write, one slot per command leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    OperationalMode(u16),
    ClearStatusFlags(u16),
    RequestDelayedSelfMaintenance(u16),
    RequestImmediateSelfMaintenance(u16),
    DeviceAddress(u16),
}

impl WriteIntent {
    pub fn register(&self) -> u16 {
        match self {
            WriteIntent::OperationalMode(_) => REG_OPERATIONAL_MODE,
            WriteIntent::ClearStatusFlags(_) => REG_CLEAR_STATUS_FLAGS,
            WriteIntent::RequestDelayedSelfMaintenance(_) => REG_DELAYED_SELF_MAINTENANCE,
            WriteIntent::RequestImmediateSelfMaintenance(_) => REG_IMMEDIATE_SELF_MAINTENANCE,
            WriteIntent::DeviceAddress(_) => REG_DEVICE_ADDRESS,
        }
    }

    pub fn value(&self) -> u16 {
        match self {
            WriteIntent::OperationalMode(v)
            | WriteIntent::ClearStatusFlags(v)
            | WriteIntent::RequestDelayedSelfMaintenance(v)
            | WriteIntent::RequestImmediateSelfMaintenance(v)
            | WriteIntent::DeviceAddress(v) => *v,
        }
    }

    fn slot(&self) -> usize {
        match self {
            WriteIntent::OperationalMode(_) => 0,
            WriteIntent::ClearStatusFlags(_) => 1,
            WriteIntent::RequestDelayedSelfMaintenance(_) => 2,
            WriteIntent::RequestImmediateSelfMaintenance(_) => 3,
            WriteIntent::DeviceAddress(_) => 4,
        }
    }
}

/// Bounded pending-write queue: at most one outstanding write per command
/// leaf, newest value wins.
#[derive(Debug, Default)]
struct PendingWrites {
    slots: [Option<WriteIntent>; 5],
}

impl PendingWrites {
    fn queue(&mut self, intent: WriteIntent) {
        self.slots[intent.slot()] = Some(intent);
    }

    /// Re-queue a failed write unless a newer value arrived meanwhile.
    fn restore(&mut self, intent: WriteIntent) {
        let slot = &mut self.slots[intent.slot()];
        if slot.is_none() {
            *slot = Some(intent);
        }
    }

    fn pop(&mut self) -> Option<WriteIntent> {
        self.slots.iter_mut().find_map(|slot| slot.take())
    }

    fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// Lifecycle and data notifications from a poller to the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Identified {
        address: u8,
        device_type: u16,
        serial: String,
        firmware_version: u32,
    },
    ConnectionChanged {
        address: u8,
        state: ConnectionState,
    },
    MeasurementsUpdated {
        address: u8,
        values: Measurements,
    },
    /// A queued external write reached the device.
    WriteApplied {
        address: u8,
        intent: WriteIntent,
    },
    /// The device answered a slave-address write; the poller at the old
    /// address ends and a fresh one must be built for the new address.
    AddressChanged {
        old: u8,
        new: u8,
    },
}

pub struct BatteryUpdater {
    controller: BatteryController,
    client: ArbiterClient,
    events: flume::Sender<DeviceEvent>,
    intents: flume::Receiver<WriteIntent>,
    state: PollerState,
    timeout_count: u8,
    command_index: usize,
    unsupported: Vec<bool>,
    pending: PendingWrites,
    cycle_start: Instant,
}

enum ReadOutcome {
    Values(Vec<u16>),
    /// The device reports the register as unsupported; success with no value.
    Unsupported,
    /// Exception that is neither a timeout nor an unsupported register.
    Rejected,
    /// Transient transport failure (timeout, CRC, framing).
    TimedOut,
}

impl BatteryUpdater {
    pub fn new(
        controller: BatteryController,
        client: ArbiterClient,
        events: flume::Sender<DeviceEvent>,
        intents: flume::Receiver<WriteIntent>,
    ) -> Self {
        Self {
            controller,
            client,
            events,
            intents,
            state: PollerState::DeviceId,
            timeout_count: 0,
            command_index: 0,
            unsupported: vec![false; ZBM_COMMANDS.len()],
            pending: PendingWrites::default(),
            cycle_start: Instant::now(),
        }
    }

    /// Drive the state machine until the daemon drops the channels or the
    /// device moves to a new address.
    pub async fn run(mut self) {
        loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    log::debug!(
                        "poller for address {} stopping: {err}",
                        self.controller.address()
                    );
                    return;
                }
            }
        }
    }

    async fn step(&mut self) -> Result<bool> {
        match self.state {
            PollerState::DeviceId => {
                self.set_connection_state(ConnectionState::Searched)?;
                match self.read(REG_DEVICE_ID, 1).await? {
                    ReadOutcome::Values(registers) => {
                        log::info!("device type {} at address {}", registers[0], self.controller.address());
                        self.controller.set_device_type(registers[0]);
                        self.timeout_count = 0;
                        self.state = PollerState::Serial;
                    }
                    ReadOutcome::TimedOut => self.on_transport_failure()?,
                    _ => {}
                }
            }
            PollerState::Serial => match self.read(REG_SERIAL, 2).await? {
                ReadOutcome::Values(registers) => {
                    let serial = serial_from_registers(&registers)
                        .ok_or_else(|| anyhow!("serial response too short"))?;
                    log::info!("serial number {serial} at address {}", self.controller.address());
                    self.controller.set_serial(Some(serial));
                    self.timeout_count = 0;
                    self.state = PollerState::FirmwareVersion;
                }
                ReadOutcome::TimedOut => self.on_transport_failure()?,
                _ => {}
            },
            PollerState::FirmwareVersion => match self.read(REG_FIRMWARE_VERSION, 2).await? {
                ReadOutcome::Values(registers) => {
                    self.controller.set_firmware_version(registers[0] as u32);
                    self.timeout_count = 0;
                    self.state = PollerState::WaitForStart;
                }
                ReadOutcome::TimedOut => self.on_transport_failure()?,
                _ => {}
            },
            PollerState::WaitForStart => {
                let serial = self
                    .controller
                    .serial()
                    .ok_or_else(|| anyhow!("identified without a serial"))?
                    .to_string();
                self.send(DeviceEvent::Identified {
                    address: self.controller.address(),
                    device_type: self.controller.device_type().unwrap_or(0),
                    serial,
                    firmware_version: self.controller.firmware_version().unwrap_or(0),
                })?;
                self.set_connection_state(ConnectionState::Detected)?;
                self.cycle_start = Instant::now();
                self.command_index = 0;
                self.state = PollerState::Acquisition;
            }
            PollerState::Acquisition => return self.acquisition_step().await,
            PollerState::Wait => {
                let elapsed = self.cycle_start.elapsed();
                if elapsed < MIN_CYCLE {
                    tokio::time::sleep(MIN_CYCLE - elapsed).await;
                }
                self.cycle_start = Instant::now();
                self.command_index = 0;
                self.state = PollerState::Acquisition;
            }
            PollerState::WaitOnConnectionLost => {
                tokio::time::sleep(CONNECTION_LOST_WAIT).await;
                // Writes queued while the device was away are stale, and the
                // unit answering after rediscovery may not be the same one.
                while self.intents.try_recv().is_ok() {}
                self.unsupported = vec![false; ZBM_COMMANDS.len()];
                self.state = PollerState::DeviceId;
            }
        }
        Ok(true)
    }

    async fn acquisition_step(&mut self) -> Result<bool> {
        self.drain_intents();
        if let Some(intent) = self.pending.pop() {
            return self.perform_write(intent).await;
        }
        if self.command_index >= ZBM_COMMANDS.len() {
            self.send(DeviceEvent::MeasurementsUpdated {
                address: self.controller.address(),
                values: self.controller.values().clone(),
            })?;
            // A full cycle is done; only now may the device count as connected.
            self.set_connection_state(ConnectionState::Connected)?;
            self.state = PollerState::Wait;
            return Ok(true);
        }
        if self.unsupported[self.command_index] {
            self.command_index += 1;
            return Ok(true);
        }

        let command: &CompositeCommand = &ZBM_COMMANDS[self.command_index];
        match self.read(command.start_register, command.count).await? {
            ReadOutcome::Values(registers) => {
                for (field, value) in decode_fields(command, &registers) {
                    self.controller.values_mut().apply(field.id, value);
                }
                self.timeout_count = 0;
                self.command_index += 1;
            }
            ReadOutcome::Unsupported => {
                log::info!(
                    "registers 0x{:04X}+{} unsupported by device {}",
                    command.start_register,
                    command.count,
                    self.controller.address()
                );
                self.unsupported[self.command_index] = true;
                for field in command.fields {
                    self.controller.values_mut().clear_field(field.id);
                }
                self.command_index += 1;
            }
            ReadOutcome::Rejected => {}
            ReadOutcome::TimedOut => self.on_transport_failure()?,
        }
        Ok(true)
    }

    /// Issue one queued write between composite reads. Returns `false` when
    /// the poller must end because the device changed address.
    async fn perform_write(&mut self, intent: WriteIntent) -> Result<bool> {
        if let WriteIntent::DeviceAddress(new_address) = intent {
            if !address_is_permanent(new_address) {
                log::warn!("ignoring device-address write to reserved address {new_address}");
                return Ok(true);
            }
        }
        let response = self
            .client
            .write_single_register(self.controller.address(), intent.register(), intent.value())
            .await?;
        match response.error {
            None => {
                self.timeout_count = 0;
                self.send(DeviceEvent::WriteApplied {
                    address: self.controller.address(),
                    intent,
                })?;
                if let WriteIntent::DeviceAddress(new_address) = intent {
                    log::warn!(
                        "device {} renumbered to {new_address}",
                        self.controller.address()
                    );
                    self.send(DeviceEvent::AddressChanged {
                        old: self.controller.address(),
                        new: new_address as u8,
                    })?;
                    return Ok(false);
                }
            }
            Some(ResponseError::Exception(code)) => {
                log::warn!(
                    "device {} rejected write to 0x{:04X}: exception 0x{code:02X}",
                    self.controller.address(),
                    intent.register()
                );
            }
            Some(_) => {
                self.pending.restore(intent);
                self.on_transport_failure()?;
            }
        }
        Ok(true)
    }

    async fn read(&mut self, start_register: u16, count: u16) -> Result<ReadOutcome> {
        let response: Response = self
            .client
            .read_holding_registers(self.controller.address(), start_register, count)
            .await?;
        Ok(match response.error {
            None => ReadOutcome::Values(response.registers().unwrap_or_default().to_vec()),
            Some(ResponseError::Exception(code)) => {
                let unsupported = matches!(
                    ExceptionCode::try_from(code),
                    Ok(ExceptionCode::IllegalFunction) | Ok(ExceptionCode::IllegalDataAddress)
                );
                if unsupported {
                    ReadOutcome::Unsupported
                } else {
                    log::warn!(
                        "device {} exception 0x{code:02X} reading 0x{start_register:04X}",
                        self.controller.address()
                    );
                    ReadOutcome::Rejected
                }
            }
            Some(_) => ReadOutcome::TimedOut,
        })
    }

    fn drain_intents(&mut self) {
        while let Ok(intent) = self.intents.try_recv() {
            self.pending.queue(intent);
        }
    }

    fn on_transport_failure(&mut self) -> Result<()> {
        self.timeout_count += 1;
        if self.timeout_count >= MAX_TIMEOUT_COUNT {
            if self.controller.serial().is_some() {
                log::error!(
                    "lost connection to device {}",
                    self.controller.address()
                );
            }
            self.pending.clear();
            self.controller.reset_values();
            self.send(DeviceEvent::MeasurementsUpdated {
                address: self.controller.address(),
                values: self.controller.values().clone(),
            })?;
            self.set_connection_state(ConnectionState::Disconnected)?;
            self.timeout_count = MAX_TIMEOUT_COUNT - 1;
            self.state = PollerState::WaitOnConnectionLost;
        }
        Ok(())
    }

    fn set_connection_state(&mut self, state: ConnectionState) -> Result<()> {
        if self.controller.set_connection_state(state) {
            self.send(DeviceEvent::ConnectionChanged {
                address: self.controller.address(),
                state,
            })?;
        }
        Ok(())
    }

    fn send(&self, event: DeviceEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!("daemon event channel closed"))
    }
}

/// Whether an address may be assigned permanently: 2…254, excluding the
/// factory defaults 1 and 99.
pub fn address_is_permanent(address: u16) -> bool {
    (2..=254).contains(&address) && address != 99
}
