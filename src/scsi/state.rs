//! The SCSI control state machine.
//!
//! The machine is level-triggered: each control cycle evaluates the state code
//! currently in the control block. A handler that consumes a state clears the
//! code; otherwise the same state runs again next cycle. Unknown codes are left
//! in place untouched.

use tracing::{debug, trace};

use crate::bridge::Bridge;
use crate::control::ControlBlock;
use crate::dispatch::{BankedCall, Dispatch};
use crate::dma::DmaControl;
use crate::error::BridgeError;
use crate::regs::{DeviceRegisters, Register};
use crate::usb::{self, UsbMode};

/// Read buffer position of the status header.
pub const BUFFER_HEADER: u32 = 0x00;
/// Read buffer position of the payload.
pub const BUFFER_PAYLOAD: u32 = 0x10;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlState {
    Idle = 0x00,
    SetupComplete = 0x01,
    TransferSetupAlt = 0x02,
    BulkMode = 0x03,
    InterruptMode = 0x04,
    PowerCheck = 0x05,
    BufferLengthReset = 0x06,
    DescriptorParse = 0x07,
    /// Runs DMA dispatch for the active slot with the auxiliary flag as mask.
    DmaKick = 0x08,
}

impl ControlState {
    pub fn from_code(code: u8) -> Option<ControlState> {
        use ControlState::*;
        Some(match code {
            0x00 => Idle,
            0x01 => SetupComplete,
            0x02 => TransferSetupAlt,
            0x03 => BulkMode,
            0x04 => InterruptMode,
            0x05 => PowerCheck,
            0x06 => BufferLengthReset,
            0x07 => DescriptorParse,
            0x08 => DmaKick,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Where a setup completion reports, and with which bytes.
///
/// The two policies differ only in constants, but they target different
/// status fields with their own meaning and stay separate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusPolicy {
    pub target: Register,
    pub error: u8,
    pub ok: u8,
}

pub const SETUP_STATUS: StatusPolicy = StatusPolicy {
    target: Register::SetupStatus,
    error: 0xE0,
    ok: 0x60,
};

pub const ALT_SETUP_STATUS: StatusPolicy = StatusPolicy {
    target: Register::AltSetupStatus,
    error: 0xF4,
    ok: 0x74,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    CompleteSetup(StatusPolicy),
    SwitchMode(UsbMode),
    CheckPower { offset: u8 },
    SetBufferLength(u32),
    ParseDescriptor { selector: Option<u8> },
    DispatchDma { mask: DmaControl },
}

/// The transition table: what a state does given the current control inputs.
pub fn plan(state: ControlState, control: &ControlBlock) -> Action {
    match state {
        ControlState::Idle => Action::None,
        ControlState::SetupComplete => Action::CompleteSetup(SETUP_STATUS),
        ControlState::TransferSetupAlt => Action::CompleteSetup(ALT_SETUP_STATUS),
        ControlState::BulkMode => Action::SwitchMode(UsbMode::Bulk),
        ControlState::InterruptMode => Action::SwitchMode(UsbMode::Interrupt),
        ControlState::PowerCheck => Action::CheckPower {
            offset: control.primary_offset,
        },
        ControlState::BufferLengthReset => Action::SetBufferLength(0),
        ControlState::DescriptorParse => Action::ParseDescriptor {
            selector: (control.aux_flag != 0).then_some(control.aux_flag),
        },
        ControlState::DmaKick => Action::DispatchDma {
            mask: DmaControl::from_bits_retain(control.aux_flag),
        },
    }
}

impl<R: DeviceRegisters, D: Dispatch> Bridge<R, D> {
    /// Evaluates the current state code once. Returns the state that ran, or
    /// `None` if the code is unknown and was left for the next cycle.
    pub fn step_state_machine(&mut self) -> Result<Option<ControlState>, BridgeError> {
        let code = self.control.state_code;
        let Some(state) = ControlState::from_code(code) else {
            trace!(code, "unknown state code left in place");
            return Ok(None);
        };
        let action = plan(state, &self.control);
        if action != Action::None {
            debug!(?state, ?action, "control state");
        }
        self.execute(action)?;
        self.control.state_code = ControlState::Idle.code();
        Ok(Some(state))
    }

    fn execute(&mut self, action: Action) -> Result<(), BridgeError> {
        match action {
            Action::None => {}
            Action::CompleteSetup(policy) => self.complete_setup(policy),
            Action::SwitchMode(mode) => {
                self.control.usb_mode = mode;
                usb::switch_mode(&mut self.regs, mode);
            }
            Action::CheckPower { offset } => {
                let up = self
                    .calls
                    .call(BankedCall::PowerCheck { offset }, &mut self.control.work);
                if up != 0 {
                    self.control.power_initialized = true;
                }
            }
            Action::SetBufferLength(len) => usb::setup_buffer_length(&mut self.regs, len),
            Action::ParseDescriptor { selector } => {
                self.calls
                    .call(BankedCall::ParseDescriptor { selector }, &mut self.control.work);
                if selector.is_none() && self.regs.read(Register::EndpointStatus) != 0 {
                    usb::reinitialize_interface(&mut self.regs);
                }
            }
            Action::DispatchDma { mask } => match self.control.active_slot {
                Some(slot) => {
                    self.dispatch_dma(slot, mask)?;
                }
                None => debug!("dma kick with no active slot"),
            },
        }
        Ok(())
    }

    fn complete_setup(&mut self, policy: StatusPolicy) {
        let marker = match self.control.active_slot {
            Some(slot) => {
                self.slots.get_mut(slot).setup_done = true;
                self.control.work.error_marker(slot.get())
            }
            None => 0,
        };
        if marker != 0 {
            self.regs.write(policy.target, policy.error as u32);
            self.regs.write(Register::BufferPointer, BUFFER_HEADER);
        } else {
            self.regs.write(Register::BufferPointer, BUFFER_PAYLOAD);
            self.regs.write(policy.target, policy.ok as u32);
        }
    }
}
