//! Optional periodic JSON status dump for external inspection. Enabled with
//! `--status-dump <path>`; writes one snapshot per second.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::device::{ConnectionState, SharedRegistry};
use crate::scanner::ScanStatus;
use crate::tree::{SharedTree, Value};

#[derive(Serialize)]
struct StatusSnapshot {
    timestamp: String,
    scanner: ScanStatus,
    devices: Vec<DeviceStatus>,
}

#[derive(Serialize)]
struct DeviceStatus {
    serial: String,
    address: u8,
    connection: ConnectionState,
    soc: Option<f64>,
    voltage: Option<f64>,
    current: Option<f64>,
}

pub async fn run(
    path: PathBuf,
    scanner: Arc<RwLock<ScanStatus>>,
    registry: SharedRegistry,
    tree: SharedTree,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let snapshot = collect(&scanner, &registry, &tree);
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&path, json) {
                    log::warn!("failed to write status dump to {}: {err}", path.display());
                }
            }
            Err(err) => log::warn!("failed to serialize status dump: {err}"),
        }
    }
}

fn collect(
    scanner: &Arc<RwLock<ScanStatus>>,
    registry: &SharedRegistry,
    tree: &SharedTree,
) -> StatusSnapshot {
    let tree = tree.read();
    let real = |root, path: &str| {
        tree.lookup_under(root, path)
            .and_then(|n| tree.value(n))
            .and_then(Value::as_f64)
    };
    let devices = registry
        .read()
        .iter()
        .map(|handle| DeviceStatus {
            serial: handle.serial.clone(),
            address: handle.address,
            connection: handle.connection,
            soc: real(handle.root, "Soc"),
            voltage: real(handle.root, "Dc/0/Voltage"),
            current: real(handle.root, "Dc/0/Current"),
        })
        .collect();
    StatusSnapshot {
        timestamp: chrono::Utc::now().to_rfc3339(),
        scanner: scanner.read().clone(),
        devices,
    }
}
