//! Device side of USB Mass Storage, Bulk-Only Transport.

// Scratchpad:
// https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/

// The host sends a 31-byte command block wrapper (CBW) on the bulk OUT endpoint, optionally
// sends or receives data depending on what command it is, and then reads a 13-byte command
// status wrapper (CSW) on the bulk IN endpoint. The CBW and CSW are simply wrappers around SCSI
// commands.

pub mod cbw;

use tracing::{debug, error};

use crate::poll::{self, Until, WaitPolicy};
use crate::regs::{DeviceRegisters, INTERFACE_INIT, LINK_LOCKUP, Register};

/// Transfer mode the data endpoint runs in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum UsbMode {
    #[default]
    Bulk,
    Interrupt,
}

impl UsbMode {
    /// Mode selector written to [`Register::UsbMode`].
    pub fn selector(self) -> u32 {
        match self {
            UsbMode::Bulk => 0,
            UsbMode::Interrupt => 1,
        }
    }

    /// Endpoint transfer type, as in `bmAttributes` of an endpoint descriptor.
    pub fn endpoint_config(self) -> u32 {
        match self {
            UsbMode::Bulk => 0x02,
            UsbMode::Interrupt => 0x03,
        }
    }
}

/// Event offsets consumed by the three interface reset variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetEvent {
    A = 0x16,
    B = 0x15,
    C = 0x19,
}

pub fn configure_endpoint<R: DeviceRegisters>(regs: &mut R, mode: UsbMode) {
    regs.write(Register::EndpointConfig, mode.endpoint_config());
}

/// Switches the USB mode, then applies the matching endpoint configuration.
pub fn switch_mode<R: DeviceRegisters>(regs: &mut R, mode: UsbMode) {
    debug!(?mode, "switching usb mode");
    regs.write(Register::UsbMode, mode.selector());
    configure_endpoint(regs, mode);
}

/// Programs the buffer length for the next data phase.
pub fn setup_buffer_length<R: DeviceRegisters>(regs: &mut R, len: u32) {
    regs.write(Register::BufferLength, len);
}

/// Resets the interface with an event offset. Event offset first, then the
/// restart.
pub fn reset_interface<R: DeviceRegisters>(regs: &mut R, event: ResetEvent) {
    debug!(?event, "resetting interface");
    regs.write(Register::InterfaceEvent, event as u32);
    regs.write(Register::InterfaceControl, INTERFACE_INIT);
}

/// Reinitializes the interface after a failed descriptor parse.
///
/// If the link reports a lockup this spins until an external device reset
/// clears it. The hardware behaves the same way; the loop has no bound.
pub fn reinitialize_interface<R: DeviceRegisters>(regs: &mut R) {
    regs.write(Register::InterfaceControl, INTERFACE_INIT);
    if regs.is_set(Register::LinkControl, LINK_LOCKUP) {
        error!("interface locked up, device reset required");
        // Forever never times out.
        let _ = poll::wait_for(
            regs,
            Register::LinkControl,
            LINK_LOCKUP,
            Until::Clear,
            WaitPolicy::Forever,
        );
    }
    regs.write(Register::EndpointStatus, 0);
}
