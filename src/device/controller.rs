//! Per-device record. Owned and mutated exclusively by the device's poller;
//! everything published outward flows through `DeviceEvent`s.

use serde::Serialize;

use super::registers::{FieldId, TypedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Searched,
    Detected,
    Connected,
}

/// Last decoded measurement set. `None` means the field is currently
/// unavailable (never read, device disconnected, or register unsupported).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurements {
    /// State of charge as a fraction (1.0 = full).
    pub soc: Option<f64>,
    pub consumed_amphours: Option<i64>,
    /// Battery terminal voltage in V.
    pub voltage: Option<f64>,
    /// Battery current in A, negative while discharging.
    pub current: Option<f64>,
    pub battery_temperature: Option<f64>,
    pub air_temperature: Option<f64>,
    pub device_state: Option<i64>,
    pub operational_mode: Option<i64>,
    /// State of health as a fraction.
    pub soh: Option<f64>,
    pub warning_flags: Option<u16>,
    pub active_alarm_flags: Option<u16>,
}

impl Measurements {
    pub fn apply(&mut self, id: FieldId, value: TypedValue) {
        match id {
            FieldId::Soc => self.soc = Some(value.as_f64()),
            FieldId::ConsumedAmphours => self.consumed_amphours = Some(value.as_f64() as i64),
            FieldId::BatteryVoltage => self.voltage = Some(value.as_f64()),
            FieldId::BatteryCurrent => self.current = Some(value.as_f64()),
            FieldId::BatteryTemperature => self.battery_temperature = Some(value.as_f64()),
            FieldId::AirTemperature => self.air_temperature = Some(value.as_f64()),
            FieldId::DeviceState => self.device_state = Some(value.as_f64() as i64),
            FieldId::OperationalMode => self.operational_mode = Some(value.as_f64() as i64),
            FieldId::StateOfHealth => self.soh = Some(value.as_f64()),
            FieldId::WarningFlags => self.warning_flags = Some(value.as_f64() as u16),
            FieldId::ActiveAlarmFlags => self.active_alarm_flags = Some(value.as_f64() as u16),
        }
    }

    pub fn clear_field(&mut self, id: FieldId) {
        match id {
            FieldId::Soc => self.soc = None,
            FieldId::ConsumedAmphours => self.consumed_amphours = None,
            FieldId::BatteryVoltage => self.voltage = None,
            FieldId::BatteryCurrent => self.current = None,
            FieldId::BatteryTemperature => self.battery_temperature = None,
            FieldId::AirTemperature => self.air_temperature = None,
            FieldId::DeviceState => self.device_state = None,
            FieldId::OperationalMode => self.operational_mode = None,
            FieldId::StateOfHealth => self.soh = None,
            FieldId::WarningFlags => self.warning_flags = None,
            FieldId::ActiveAlarmFlags => self.active_alarm_flags = None,
        }
    }

    pub fn clear(&mut self) {
        *self = Measurements::default();
    }

    /// DC power in W, derived from voltage and current.
    pub fn power(&self) -> Option<f64> {
        Some(self.voltage? * self.current?)
    }
}

#[derive(Debug)]
pub struct BatteryController {
    port_name: String,
    address: u8,
    connection_state: ConnectionState,
    device_type: Option<u16>,
    serial: Option<String>,
    firmware_version: Option<u32>,
    values: Measurements,
}

impl BatteryController {
    pub fn new(port_name: &str, address: u8) -> Self {
        log::info!("new battery controller at address {address}");
        Self {
            port_name: port_name.to_string(),
            address,
            connection_state: ConnectionState::Disconnected,
            device_type: None,
            serial: None,
            firmware_version: None,
            values: Measurements::default(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Returns whether the state actually changed.
    pub fn set_connection_state(&mut self, state: ConnectionState) -> bool {
        if self.connection_state == state {
            return false;
        }
        self.connection_state = state;
        true
    }

    pub fn device_type(&self) -> Option<u16> {
        self.device_type
    }

    pub fn set_device_type(&mut self, device_type: u16) {
        self.device_type = Some(device_type);
    }

    pub fn product_name(&self) -> &'static str {
        "ZBM"
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn set_serial(&mut self, serial: Option<String>) {
        self.serial = serial;
    }

    pub fn firmware_version(&self) -> Option<u32> {
        self.firmware_version
    }

    pub fn set_firmware_version(&mut self, version: u32) {
        self.firmware_version = Some(version);
    }

    pub fn values(&self) -> &Measurements {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Measurements {
        &mut self.values
    }

    /// Reset all measured values to unavailable.
    pub fn reset_values(&mut self) {
        self.values.clear();
    }
}
