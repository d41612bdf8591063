//! Per-device bridge: mounts one battery as a service subtree and keeps its
//! leaves in sync with the poller's events.
//!
//! The service is mounted at `zbmnode.modbus<serial>`, so a device keeps its
//! mount across reconnects and address changes. Identification leaves are set
//! once; measurement leaves follow `MeasurementsUpdated` events and are
//! invalidated while the device is disconnected. Command leaves carry a write
//! sink so external writes become poller intents instead of local stores.

use crate::device::{ConnectionState, Measurements, WriteIntent};
use crate::tree::item::{ItemTree, ItemWrite, NodeId, Value};

pub const PRODUCT_NAME: &str = "ZBM";
/// Victron product id for the Redflow ZBM2.
pub const PRODUCT_ID: i64 = 0xB012;

/// Alarm leaf names, in warning/active bitfield bit order (bit 0 first).
pub const ALARM_NAMES: [&str; 16] = [
    "Maintenance",
    "MaintenanceActive",
    "OverCurrent",
    "OverVoltage",
    "BatteryTemperature",
    "ZincPump",
    "BromidePump",
    "LeakSensors",
    "InternalFailure",
    "ElectricBoard",
    "BatteryTemperatureSensor",
    "AirTemperatureSensor",
    "StateOfHealth",
    "Leak1Trip",
    "Leak2Trip",
    "Unknown",
];

/// Alarm leaf values.
pub const ALARM_CLEAR: i64 = 0;
pub const ALARM_WARNING: i64 = 1;
pub const ALARM_ACTIVE: i64 = 2;

pub struct BatteryBridge {
    root: NodeId,
    connected: NodeId,
    voltage: NodeId,
    current: NodeId,
    power: NodeId,
    temperature: NodeId,
    soc: NodeId,
    soh: NodeId,
    operational_mode: NodeId,
    consumed_amphours: NodeId,
    air_temperature: NodeId,
    state: NodeId,
    device_address: NodeId,
    clear_status: NodeId,
    delayed_maintenance: NodeId,
    immediate_maintenance: NodeId,
    alarms: [NodeId; ALARM_NAMES.len()],
}

/// Mount parameters for one device service.
pub struct BridgeConfig<'a> {
    pub port_name: &'a str,
    pub serial: &'a str,
    pub address: u8,
    pub device_type: u16,
    pub firmware_version: u32,
    /// Sink receiving external writes on the command leaves.
    pub writes: flume::Sender<ItemWrite>,
}

impl BatteryBridge {
    pub fn service_name(serial: &str) -> String {
        format!("zbmnode.modbus{serial}")
    }

    pub fn new(tree: &mut ItemTree, config: BridgeConfig<'_>) -> Self {
        let root = tree.get_or_create(&Self::service_name(config.serial));

        let connected = produce(tree, root, "Connected", Some(Value::Int(1)));
        tree.set_description(connected, "Connected");

        // Identification leaves; their values never change after mounting.
        let process_name = std::env::args().next().unwrap_or_default();
        produce(tree, root, "Mgmt/ProcessName", Some(Value::Text(process_name)));
        produce(
            tree,
            root,
            "Mgmt/ProcessVersion",
            Some(Value::Text(env!("CARGO_PKG_VERSION").to_string())),
        );
        produce(
            tree,
            root,
            "Mgmt/Connection",
            Some(Value::Text(config.port_name.to_string())),
        );
        produce(
            tree,
            root,
            "ProductName",
            Some(Value::Text(PRODUCT_NAME.to_string())),
        );
        produce(tree, root, "ProductId", Some(Value::Int(PRODUCT_ID)));
        produce(
            tree,
            root,
            "FirmwareVersion",
            Some(Value::Int(config.firmware_version as i64)),
        );
        produce(
            tree,
            root,
            "DeviceType",
            Some(Value::Int(config.device_type as i64)),
        );
        produce(
            tree,
            root,
            "Serial",
            Some(Value::Text(config.serial.to_string())),
        );
        produce(
            tree,
            root,
            "DeviceInstance",
            Some(Value::Int(device_instance(config.port_name) as i64)),
        );
        produce(
            tree,
            root,
            "Capabilities",
            Some(Value::Text("Redflow,IntegratedSoc".to_string())),
        );

        let custom_name = produce(tree, root, "CustomName", None);
        tree.set_sink(custom_name, config.writes.clone());
        tree.set_default(custom_name, Value::Text(PRODUCT_NAME.to_string()));

        let voltage = produce(tree, root, "Dc/0/Voltage", None);
        tree.set_unit(voltage, "V", 1);
        let current = produce(tree, root, "Dc/0/Current", None);
        tree.set_unit(current, "A", 1);
        let power = produce(tree, root, "Dc/0/Power", None);
        tree.set_unit(power, "W", 0);
        let temperature = produce(tree, root, "Dc/0/Temperature", None);
        tree.set_unit(temperature, "C", 1);
        let soc = produce(tree, root, "Soc", None);
        tree.set_unit(soc, "%", 0);
        let soh = produce(tree, root, "Soh", None);
        tree.set_unit(soh, "%", 0);
        let consumed_amphours = produce(tree, root, "ConsumedAmphours", None);
        tree.set_unit(consumed_amphours, "Ah", 0);
        let air_temperature = produce(tree, root, "AirTemperature", None);
        tree.set_unit(air_temperature, "C", 1);
        let state = produce(tree, root, "State", None);

        let operational_mode = produce(tree, root, "OperationalMode", None);
        tree.set_sink(operational_mode, config.writes.clone());
        tree.set_description(operational_mode, "Operational mode");

        let device_address = produce(tree, root, "DeviceAddress", Some(Value::Int(config.address as i64)));
        tree.set_sink(device_address, config.writes.clone());
        tree.set_min(device_address, Value::Int(2));
        tree.set_max(device_address, Value::Int(254));
        tree.set_description(device_address, "Modbus slave address");

        let clear_status = produce(tree, root, "ClearStatusRegisterFlags", None);
        tree.set_sink(clear_status, config.writes.clone());
        let delayed_maintenance = produce(tree, root, "RequestDelayedSelfMaintenance", None);
        tree.set_sink(delayed_maintenance, config.writes.clone());
        let immediate_maintenance = produce(tree, root, "RequestImmediateSelfMaintenance", None);
        tree.set_sink(immediate_maintenance, config.writes);

        let alarms = ALARM_NAMES.map(|name| {
            let leaf = produce(tree, root, &format!("Alarms/{name}"), None);
            tree.set_min(leaf, Value::Int(ALARM_CLEAR));
            tree.set_max(leaf, Value::Int(ALARM_ACTIVE));
            leaf
        });

        Self {
            root,
            connected,
            voltage,
            current,
            power,
            temperature,
            soc,
            soh,
            operational_mode,
            consumed_amphours,
            air_temperature,
            state,
            device_address,
            clear_status,
            delayed_maintenance,
            immediate_maintenance,
            alarms,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn apply_measurements(&self, tree: &mut ItemTree, values: &Measurements) {
        set_real(tree, self.voltage, values.voltage);
        set_real(tree, self.current, values.current);
        set_real(tree, self.power, values.power());
        set_real(tree, self.temperature, values.battery_temperature);
        set_real(tree, self.air_temperature, values.air_temperature);
        set_int(tree, self.consumed_amphours, values.consumed_amphours);
        set_int(tree, self.state, values.device_state);
        set_int(tree, self.operational_mode, values.operational_mode);
        // Fractions are presented as percent.
        set_real(tree, self.soc, values.soc.map(|v| v * 100.0));
        set_real(tree, self.soh, values.soh.map(|v| v * 100.0));
        self.apply_alarms(tree, values.warning_flags, values.active_alarm_flags);
    }

    fn apply_alarms(&self, tree: &mut ItemTree, warning: Option<u16>, active: Option<u16>) {
        for (bit, leaf) in self.alarms.iter().enumerate() {
            match (warning, active) {
                (None, None) => tree.invalidate(*leaf),
                _ => {
                    let warning_set = warning.unwrap_or(0) & (1 << bit) != 0;
                    let active_set = active.unwrap_or(0) & (1 << bit) != 0;
                    let level = if active_set {
                        ALARM_ACTIVE
                    } else if warning_set {
                        ALARM_WARNING
                    } else {
                        ALARM_CLEAR
                    };
                    tree.set_value(*leaf, Value::Int(level));
                }
            }
        }
    }

    pub fn set_connection(&self, tree: &mut ItemTree, state: ConnectionState) {
        let connected = (state != ConnectionState::Disconnected) as i64;
        tree.set_value(self.connected, Value::Int(connected));
        if state == ConnectionState::Disconnected {
            self.invalidate_measurements(tree);
        }
    }

    /// Null every measurement leaf while keeping the leaves themselves.
    pub fn invalidate_measurements(&self, tree: &mut ItemTree) {
        for leaf in [
            self.voltage,
            self.current,
            self.power,
            self.temperature,
            self.air_temperature,
            self.consumed_amphours,
            self.state,
            self.operational_mode,
            self.soc,
            self.soh,
        ] {
            tree.invalidate(leaf);
        }
        for leaf in self.alarms {
            tree.invalidate(leaf);
        }
    }

    /// Reflect a confirmed external write back onto its leaf. A confirmed set
    /// always notifies, so repeated identical writes stay observable.
    pub fn apply_write(&self, tree: &mut ItemTree, intent: &WriteIntent) {
        let (leaf, value) = match intent {
            WriteIntent::OperationalMode(v) => (self.operational_mode, *v),
            WriteIntent::ClearStatusFlags(v) => (self.clear_status, *v),
            WriteIntent::RequestDelayedSelfMaintenance(v) => (self.delayed_maintenance, *v),
            WriteIntent::RequestImmediateSelfMaintenance(v) => (self.immediate_maintenance, *v),
            WriteIntent::DeviceAddress(v) => (self.device_address, *v),
        };
        tree.set_value_notify(leaf, Value::Int(value as i64));
    }

    pub fn set_device_address(&self, tree: &mut ItemTree, address: u8) {
        tree.set_value(self.device_address, Value::Int(address as i64));
    }

    pub fn worst_alarm(&self, tree: &ItemTree) -> Option<i64> {
        self.alarms
            .iter()
            .filter_map(|leaf| tree.value(*leaf).and_then(Value::as_i64))
            .max()
    }
}

fn produce(tree: &mut ItemTree, root: NodeId, path: &str, value: Option<Value>) -> NodeId {
    let leaf = tree.get_or_create_under(root, path);
    if let Some(value) = value {
        tree.set_value(leaf, value);
    }
    leaf
}

fn set_real(tree: &mut ItemTree, leaf: NodeId, value: Option<f64>) {
    match value {
        Some(v) => {
            tree.set_value(leaf, Value::Real(v));
        }
        None => tree.invalidate(leaf),
    }
}

fn set_int(tree: &mut ItemTree, leaf: NodeId, value: Option<i64>) {
    match value {
        Some(v) => {
            tree.set_value(leaf, Value::Int(v));
        }
        None => tree.invalidate(leaf),
    }
}

/// Derive the service's device instance from the serial port name.
pub fn device_instance(port_name: &str) -> i32 {
    instance_for(port_name, "/dev/ttyUSB", 288)
        .or_else(|| instance_for(port_name, "/dev/ttyO", 256))
        .unwrap_or(-1)
}

fn instance_for(path: &str, prefix: &str, base: i32) -> Option<i32> {
    path.strip_prefix(prefix)?
        .parse::<i32>()
        .ok()
        .map(|n| base + n)
}
