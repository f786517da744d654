//! Core of a USB Mass Storage (Bulk-Only Transport, SCSI) to NVMe bridge.
//!
//! The host talks BOT: a command block wrapper arrives, data moves, a command
//! status wrapper goes back. The bridge tracks each command in a 32-entry
//! slot table, turns media commands into NVMe submissions, drains NVMe
//! completions back into the slots, and reports status once every slot of a
//! command has settled. All hardware access goes through
//! [`regs::DeviceRegisters`].

pub mod bridge;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod dma;
pub mod error;
pub mod nvme;
pub mod poll;
pub mod regs;
pub mod scsi;
pub mod sim;
pub mod slot;
pub mod usb;

#[cfg(test)]
mod test_support;

pub use bridge::{Admission, Bridge, CycleReport};
pub use config::BridgeConfig;
pub use error::BridgeError;
