//! Aggregate battery service.
//!
//! One summary service mounts next to the per-device subtrees and condenses
//! every connected battery into fleet-level values. Its command leaves are
//! plain stored leaves; each update tick fans the requested command out to
//! every member poller and rearms the leaf.

use crate::device::{ConnectionState, DeviceHandle, WriteIntent};
use crate::tree::bridge::PRODUCT_ID;
use crate::tree::item::{ItemTree, NodeId, Value};

pub const SERVICE_NAME: &str = "battery.zbm";
/// Sentinel on the summary operational-mode leaf meaning "no request".
const MODE_IDLE: i64 = -1;

/// A monitor updates its derived values on the daemon tick and reacts to
/// devices leaving the registry.
pub trait Monitor {
    fn update_values(&mut self, tree: &mut ItemTree, devices: &[DeviceHandle]);

    fn on_device_removed(&mut self, tree: &mut ItemTree, serial: &str);
}

pub struct BatterySummary {
    zbm_count: NodeId,
    voltage: NodeId,
    current: NodeId,
    power: NodeId,
    temperature: NodeId,
    soc: NodeId,
    worst_alarm: NodeId,
    operational_mode: NodeId,
    clear_status: NodeId,
    delayed_maintenance: NodeId,
    immediate_maintenance: NodeId,
    maintenance: NodeId,
    maintenance_active: NodeId,
}

impl BatterySummary {
    pub fn new(tree: &mut ItemTree) -> Self {
        let root = tree.get_or_create(SERVICE_NAME);

        // These three leaves are what an external supervisor keys on to treat
        // the service as present and healthy.
        let connection = tree.get_or_create_under(root, "Mgmt/Connection");
        tree.set_value(connection, Value::Text("Modbus".to_string()));
        let product_name = tree.get_or_create_under(root, "ProductName");
        tree.set_value(product_name, Value::Text("Redflow ZBM".to_string()));
        let connected = tree.get_or_create_under(root, "Connected");
        tree.set_value(connected, Value::Int(1));
        let product_id = tree.get_or_create_under(root, "ProductId");
        tree.set_value(product_id, Value::Int(PRODUCT_ID));
        let instance = tree.get_or_create_under(root, "DeviceInstance");
        tree.set_value(instance, Value::Int(40));

        let zbm_count = tree.get_or_create_under(root, "ZbmCount");
        let voltage = tree.get_or_create_under(root, "Dc/0/Voltage");
        tree.set_unit(voltage, "V", 1);
        let current = tree.get_or_create_under(root, "Dc/0/Current");
        tree.set_unit(current, "A", 1);
        let power = tree.get_or_create_under(root, "Dc/0/Power");
        tree.set_unit(power, "W", 0);
        let temperature = tree.get_or_create_under(root, "Dc/0/Temperature");
        tree.set_unit(temperature, "C", 1);
        let soc = tree.get_or_create_under(root, "Soc");
        tree.set_unit(soc, "%", 0);
        let worst_alarm = tree.get_or_create_under(root, "Alarms/Alarm");

        let operational_mode = tree.get_or_create_under(root, "OperationalMode");
        tree.set_writable(operational_mode, true);
        tree.set_default(operational_mode, Value::Int(MODE_IDLE));
        tree.set_value(operational_mode, Value::Int(MODE_IDLE));
        let clear_status = tree.get_or_create_under(root, "ClearStatusRegisterFlags");
        tree.set_writable(clear_status, true);
        tree.set_value(clear_status, Value::Int(0));
        let delayed_maintenance = tree.get_or_create_under(root, "RequestDelayedSelfMaintenance");
        tree.set_writable(delayed_maintenance, true);
        tree.set_value(delayed_maintenance, Value::Int(0));
        let immediate_maintenance =
            tree.get_or_create_under(root, "RequestImmediateSelfMaintenance");
        tree.set_writable(immediate_maintenance, true);
        tree.set_value(immediate_maintenance, Value::Int(0));

        let maintenance = tree.get_or_create_under(root, "Alarms/Maintenance");
        let maintenance_active = tree.get_or_create_under(root, "Alarms/MaintenanceActive");

        Self {
            zbm_count,
            voltage,
            current,
            power,
            temperature,
            soc,
            worst_alarm,
            operational_mode,
            clear_status,
            delayed_maintenance,
            immediate_maintenance,
            maintenance,
            maintenance_active,
        }
    }

    fn broadcast(&self, tree: &mut ItemTree, devices: &[DeviceHandle]) {
        let mode = tree
            .value(self.operational_mode)
            .and_then(Value::as_i64)
            .unwrap_or(MODE_IDLE);
        if mode != MODE_IDLE {
            if let Ok(value) = u16::try_from(mode) {
                for device in devices {
                    let _ = device.intents.send(WriteIntent::OperationalMode(value));
                }
            }
            tree.set_value(self.operational_mode, Value::Int(MODE_IDLE));
        }

        let commands: [(NodeId, fn(u16) -> WriteIntent); 3] = [
            (self.clear_status, WriteIntent::ClearStatusFlags),
            (
                self.delayed_maintenance,
                WriteIntent::RequestDelayedSelfMaintenance,
            ),
            (
                self.immediate_maintenance,
                WriteIntent::RequestImmediateSelfMaintenance,
            ),
        ];
        for (leaf, intent) in commands {
            let requested = tree.value(leaf).and_then(Value::as_i64) == Some(1);
            if requested {
                for device in devices {
                    let _ = device.intents.send(intent(1));
                }
                tree.set_value(leaf, Value::Int(0));
            }
        }
    }
}

impl Monitor for BatterySummary {
    fn update_values(&mut self, tree: &mut ItemTree, devices: &[DeviceHandle]) {
        self.broadcast(tree, devices);

        let connected: Vec<&DeviceHandle> = devices
            .iter()
            .filter(|d| d.connection == ConnectionState::Connected)
            .collect();

        let mut voltage_total = 0.0;
        let mut voltage_count = 0u32;
        let mut current_total = 0.0;
        let mut current_count = 0u32;
        let mut power_total = 0.0;
        let mut temperature_max: Option<f64> = None;
        let mut soc_total = 0.0;
        let mut soc_count = 0u32;
        let mut worst_alarm: Option<i64> = None;
        let mut all_maintenance = !connected.is_empty();
        let mut all_maintenance_active = !connected.is_empty();

        for device in &connected {
            if let Some(v) = real_leaf(tree, device.root, "Dc/0/Voltage") {
                if v > 0.0 {
                    voltage_total += v;
                    voltage_count += 1;
                }
            }
            if let Some(i) = real_leaf(tree, device.root, "Dc/0/Current") {
                current_total += i;
                current_count += 1;
            }
            if let Some(p) = real_leaf(tree, device.root, "Dc/0/Power") {
                power_total += p;
            }
            if let Some(t) = real_leaf(tree, device.root, "Dc/0/Temperature") {
                temperature_max = Some(temperature_max.map_or(t, |m: f64| m.max(t)));
            }
            if let Some(s) = real_leaf(tree, device.root, "Soc") {
                soc_total += s;
                soc_count += 1;
            }
            for name in super::bridge::ALARM_NAMES {
                let level = tree
                    .lookup_under(device.root, &format!("Alarms/{name}"))
                    .and_then(|n| tree.value(n))
                    .and_then(Value::as_i64);
                if let Some(level) = level {
                    worst_alarm = Some(worst_alarm.map_or(level, |w| w.max(level)));
                }
            }
            let maintenance = int_leaf(tree, device.root, "Alarms/Maintenance");
            all_maintenance = all_maintenance && maintenance.unwrap_or(0) != 0;
            let active = int_leaf(tree, device.root, "Alarms/MaintenanceActive");
            all_maintenance_active = all_maintenance_active && active.unwrap_or(0) != 0;
        }

        tree.set_value(self.zbm_count, Value::Int(connected.len() as i64));
        set_optional(
            tree,
            self.voltage,
            (voltage_count > 0).then(|| voltage_total / voltage_count as f64),
        );
        set_optional(tree, self.current, (current_count > 0).then_some(current_total));
        set_optional(tree, self.power, (current_count > 0).then_some(power_total));
        set_optional(tree, self.temperature, temperature_max);
        set_optional(
            tree,
            self.soc,
            (soc_count > 0).then(|| soc_total / soc_count as f64),
        );
        match worst_alarm {
            Some(level) => {
                tree.set_value(self.worst_alarm, Value::Int(level));
            }
            None => tree.invalidate(self.worst_alarm),
        }
        tree.set_value(self.maintenance, Value::Int(all_maintenance as i64));
        tree.set_value(
            self.maintenance_active,
            Value::Int(all_maintenance_active as i64),
        );
    }

    fn on_device_removed(&mut self, _tree: &mut ItemTree, serial: &str) {
        log::info!("summary dropping battery {serial}");
    }
}

fn real_leaf(tree: &ItemTree, root: NodeId, path: &str) -> Option<f64> {
    tree.lookup_under(root, path)
        .and_then(|n| tree.value(n))
        .and_then(Value::as_f64)
}

fn int_leaf(tree: &ItemTree, root: NodeId, path: &str) -> Option<i64> {
    tree.lookup_under(root, path)
        .and_then(|n| tree.value(n))
        .and_then(Value::as_i64)
}

fn set_optional(tree: &mut ItemTree, leaf: NodeId, value: Option<f64>) {
    match value {
        Some(v) => {
            tree.set_value(leaf, Value::Real(v));
        }
        None => tree.invalidate(leaf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registers::{FieldId, TypedValue};
    use crate::device::Measurements;
    use crate::tree::bridge::{BatteryBridge, BridgeConfig};

    fn mount_device(
        tree: &mut ItemTree,
        serial: &str,
        address: u8,
    ) -> (BatteryBridge, DeviceHandle, flume::Receiver<WriteIntent>) {
        let (writes_tx, _writes_rx) = flume::unbounded();
        let bridge = BatteryBridge::new(
            tree,
            BridgeConfig {
                port_name: "/dev/ttyUSB0",
                serial,
                address,
                device_type: 0x4001,
                firmware_version: 1,
                writes: writes_tx,
            },
        );
        let (intents_tx, intents_rx) = flume::unbounded();
        let handle = DeviceHandle {
            serial: serial.to_string(),
            address,
            root: bridge.root(),
            connection: ConnectionState::Connected,
            intents: intents_tx,
        };
        (bridge, handle, intents_rx)
    }

    fn measurements(soc: f64, voltage: f64, current: f64, temperature: f64) -> Measurements {
        let mut values = Measurements::default();
        values.apply(FieldId::Soc, TypedValue::Real(soc));
        values.apply(FieldId::BatteryVoltage, TypedValue::Real(voltage));
        values.apply(FieldId::BatteryCurrent, TypedValue::Real(current));
        values.apply(FieldId::BatteryTemperature, TypedValue::Real(temperature));
        values
    }

    #[test]
    fn aggregates_across_connected_devices() {
        let mut tree = ItemTree::new();
        let mut summary = BatterySummary::new(&mut tree);
        let (bridge_a, handle_a, _rx_a) = mount_device(&mut tree, "1001", 2);
        let (bridge_b, handle_b, _rx_b) = mount_device(&mut tree, "1002", 3);

        bridge_a.apply_measurements(&mut tree, &measurements(0.80, 48.0, -10.0, 30.0));
        bridge_b.apply_measurements(&mut tree, &measurements(0.60, 50.0, 5.0, 35.5));

        summary.update_values(&mut tree, &[handle_a, handle_b]);

        let value = |path: &str| tree.lookup(path).and_then(|n| tree.value(n).cloned());
        assert_eq!(value("battery.zbm/ZbmCount"), Some(Value::Int(2)));
        assert_eq!(value("battery.zbm/Dc/0/Voltage"), Some(Value::Real(49.0)));
        assert_eq!(value("battery.zbm/Dc/0/Current"), Some(Value::Real(-5.0)));
        assert_eq!(value("battery.zbm/Dc/0/Power"), Some(Value::Real(-230.0)));
        assert_eq!(
            value("battery.zbm/Dc/0/Temperature"),
            Some(Value::Real(35.5))
        );
        assert_eq!(value("battery.zbm/Soc"), Some(Value::Real(70.0)));
    }

    #[test]
    fn empty_fleet_keeps_service_with_null_values() {
        let mut tree = ItemTree::new();
        let mut summary = BatterySummary::new(&mut tree);
        summary.update_values(&mut tree, &[]);

        let count = tree.lookup("battery.zbm/ZbmCount").unwrap();
        assert_eq!(tree.value(count), Some(&Value::Int(0)));
        let voltage = tree.lookup("battery.zbm/Dc/0/Voltage").unwrap();
        assert_eq!(tree.value(voltage), None);
        let connected = tree.lookup("battery.zbm/Connected").unwrap();
        assert_eq!(tree.value(connected), Some(&Value::Int(1)));
    }

    #[test]
    fn disconnected_devices_are_excluded() {
        let mut tree = ItemTree::new();
        let mut summary = BatterySummary::new(&mut tree);
        let (bridge_a, handle_a, _rx_a) = mount_device(&mut tree, "1001", 2);
        let (_bridge_b, mut handle_b, _rx_b) = mount_device(&mut tree, "1002", 3);
        handle_b.connection = ConnectionState::Disconnected;

        bridge_a.apply_measurements(&mut tree, &measurements(0.80, 48.0, -10.0, 30.0));
        summary.update_values(&mut tree, &[handle_a, handle_b]);

        let count = tree.lookup("battery.zbm/ZbmCount").unwrap();
        assert_eq!(tree.value(count), Some(&Value::Int(1)));
        let voltage = tree.lookup("battery.zbm/Dc/0/Voltage").unwrap();
        assert_eq!(tree.value(voltage), Some(&Value::Real(48.0)));
    }

    #[test]
    fn summary_commands_broadcast_and_rearm() {
        let mut tree = ItemTree::new();
        let mut summary = BatterySummary::new(&mut tree);
        let (_bridge_a, handle_a, rx_a) = mount_device(&mut tree, "1001", 2);
        let (_bridge_b, handle_b, rx_b) = mount_device(&mut tree, "1002", 3);

        assert_eq!(
            tree.write_value("battery.zbm/OperationalMode", Value::Int(2)),
            crate::tree::WriteDisposition::Stored
        );
        tree.write_value("battery.zbm/RequestDelayedSelfMaintenance", Value::Int(1));

        summary.update_values(&mut tree, &[handle_a, handle_b]);

        for rx in [&rx_a, &rx_b] {
            let sent: Vec<WriteIntent> = rx.drain().collect();
            assert!(sent.contains(&WriteIntent::OperationalMode(2)));
            assert!(sent.contains(&WriteIntent::RequestDelayedSelfMaintenance(1)));
        }
        // Leaves rearm so the next tick does not re-broadcast.
        let mode = tree.lookup("battery.zbm/OperationalMode").unwrap();
        assert_eq!(tree.value(mode), Some(&Value::Int(-1)));
    }
}
