pub mod controller;
pub mod registers;
pub mod updater;

pub use controller::{BatteryController, ConnectionState, Measurements};
pub use updater::{BatteryUpdater, DeviceEvent, PollerState, WriteIntent};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::tree::NodeId;

/// Daemon-side view of one mounted device. The record itself lives inside the
/// poller; this handle carries what the summary, snapshot and write routing
/// need.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub serial: String,
    pub address: u8,
    pub root: NodeId,
    pub connection: ConnectionState,
    pub intents: flume::Sender<WriteIntent>,
}

pub type SharedRegistry = Arc<RwLock<Vec<DeviceHandle>>>;
