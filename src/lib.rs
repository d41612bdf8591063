//! redflow-bridge: Modbus RTU bridge daemon for Redflow ZBM flow batteries.
//!
//! The daemon owns a single serial Modbus RTU link, discovers ZBM nodes
//! across the address space (renumbering factory-default units to free
//! addresses first), polls each confirmed device through a per-device state
//! machine, and publishes everything as a hierarchical tree of typed items
//! with change notifications and remote set support. The batteries carry
//! their own BMS; this daemon reads state and forwards command intents, it
//! performs no battery management of its own.

pub mod config;
pub mod daemon;
pub mod device;
pub mod protocol;
pub mod scanner;
pub mod serial;
pub mod snapshot;
pub mod tree;
