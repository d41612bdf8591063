pub mod bridge;
pub mod item;
pub mod summary;

pub use bridge::BatteryBridge;
pub use item::{ItemChange, ItemTree, ItemWrite, NodeId, Value, WriteDisposition};
pub use summary::{BatterySummary, Monitor};

use std::sync::Arc;

use parking_lot::RwLock;

/// The tree is written by pollers (through their bridges) and read by the
/// summary, the snapshot and the external bus.
pub type SharedTree = Arc<RwLock<ItemTree>>;

pub fn shared() -> SharedTree {
    Arc::new(RwLock::new(ItemTree::new()))
}
