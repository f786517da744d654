//! DMA programming and control-bit dispatch.

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::dispatch::{BankedCall, Dispatch};
use crate::error::BridgeError;
use crate::poll::{self, Until};
use crate::regs::{DMA_READY, DMA_START, DeviceRegisters, FIFO_READY, Register};
use crate::slot::{RetryVerdict, SlotIndex, SlotState};
use crate::usb::cbw::Direction;
use crate::usb::{self, ResetEvent};

/// Accumulator pattern loaded when a DMA burst is kicked off.
pub const PARTIAL_PATTERN: u32 = 0x0000_0100;

bitflags! {
    /// Control bits consumed by [`Bridge::dispatch_dma`]. Bits are examined
    /// lowest first and the first one handled ends the dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmaControl: u8 {
        const STATUS_CHECK = 1 << 0;
        const CONFIGURE_ENDPOINT = 1 << 1;
        const RESET_A = 1 << 2;
        const RESET_B = 1 << 3;
        const RESET_C = 1 << 4;
        const POLL = 1 << 5;
        const TRIGGER = 1 << 6;
    }
}

/// Per-slot DMA engine state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum DmaState {
    #[default]
    Idle,
    /// The secondary poll reported not ready.
    Waiting,
    /// The trigger found the FIFO not ready; the control cycle retries it.
    TriggerPending,
    /// A burst was started.
    Active,
    /// Latched non-zero result of the status check routine.
    Status(u8),
}

/// What one dispatch did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmaOutcome {
    StatusLatched(u8),
    FifoNotReady,
    EndpointConfigured,
    InterfaceReset(ResetEvent),
    /// A reset reloaded an accumulator at or past the overflow threshold.
    Overflow(RetryVerdict),
    Waiting,
    PollReady,
    Triggered,
    /// No control bit was set past the status check.
    Nothing,
}

/// Result of programming the DMA engine for a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmaSetup {
    Configured,
    /// The engine stayed busy; the slot remains pending and is retried.
    Retry(u8),
    /// The engine stayed busy too many times; the slot was failed.
    Failed,
}

impl<R: DeviceRegisters, D: Dispatch> Bridge<R, D> {
    /// Programs the DMA engine for a pending slot once the engine reports
    /// ready, and moves the slot to `DmaConfigured`.
    pub fn configure_dma(&mut self, slot: SlotIndex) -> Result<DmaSetup, BridgeError> {
        let ready = poll::wait_for(
            &mut self.regs,
            Register::TransferStatus,
            DMA_READY,
            Until::Set,
            self.cfg.wait_policy(),
        );
        if let Err(timeout) = ready {
            warn!(slot = %slot, %timeout, "dma engine not ready");
            return Ok(match self.slots.note_retry(slot, self.cfg.max_retries) {
                RetryVerdict::Retry(n) => DmaSetup::Retry(n),
                RetryVerdict::Exhausted => DmaSetup::Failed,
            });
        }

        let s = self.slots.get(slot);
        let direction = match s.direction {
            Direction::DeviceToHost => 1,
            Direction::HostToDevice => 0,
        };
        let length = match s.segment {
            Some(segment) => segment.blocks.saturating_mul(self.cfg.block_size),
            None => s.requested_length,
        };
        self.regs.write(Register::DmaSlot, slot.get() as u32);
        self.regs.write(Register::DmaLength, length);
        self.regs.write(Register::DmaDirection, direction);
        self.slots.transition(slot, SlotState::DmaConfigured)?;
        debug!(slot = %slot, length, "dma configured");
        Ok(DmaSetup::Configured)
    }

    /// Examines the control bits in `mask` for `slot`.
    pub fn dispatch_dma(
        &mut self,
        slot: SlotIndex,
        mask: DmaControl,
    ) -> Result<DmaOutcome, BridgeError> {
        if mask.contains(DmaControl::STATUS_CHECK) {
            let status = self
                .calls
                .call(BankedCall::DmaStatusCheck { slot }, &mut self.control.work);
            if status != 0 {
                self.slots.get_mut(slot).dma = DmaState::Status(status);
                debug!(slot = %slot, status, "dma status latched");
                return Ok(DmaOutcome::StatusLatched(status));
            }
        }

        if !self.regs.is_set(Register::FifoStatus, FIFO_READY) {
            return Ok(DmaOutcome::FifoNotReady);
        }

        if mask.contains(DmaControl::CONFIGURE_ENDPOINT) {
            usb::configure_endpoint(&mut self.regs, self.control.usb_mode);
            self.control.accumulator = 0;
            return Ok(DmaOutcome::EndpointConfigured);
        }

        let resets = [
            (DmaControl::RESET_A, ResetEvent::A),
            (DmaControl::RESET_B, ResetEvent::B),
            (DmaControl::RESET_C, ResetEvent::C),
        ];
        if let Some(&(bit, event)) = resets.iter().find(|(bit, _)| mask.contains(*bit)) {
            usb::reset_interface(&mut self.regs, event);
            if bit != DmaControl::RESET_A {
                self.control.accumulator = self.regs.read(Register::TransferCount);
                if let Some(verdict) = self.check_overflow(slot) {
                    return Ok(DmaOutcome::Overflow(verdict));
                }
            }
            return Ok(DmaOutcome::InterfaceReset(event));
        }

        if mask.contains(DmaControl::POLL) {
            self.control.accumulator = 0;
            if self.calls.call(BankedCall::SecondaryPoll, &mut self.control.work) == 0 {
                self.slots.get_mut(slot).dma = DmaState::Waiting;
                return Ok(DmaOutcome::Waiting);
            }
            return Ok(DmaOutcome::PollReady);
        }

        if mask.contains(DmaControl::TRIGGER) {
            self.control.accumulator = PARTIAL_PATTERN;
            self.regs.write(Register::DmaTrigger, DMA_START);
            let s = self.slots.get_mut(slot);
            s.dma = DmaState::Active;
            if s.state == SlotState::DmaConfigured {
                let held = std::mem::take(&mut s.completion_held);
                self.slots.transition(slot, SlotState::Active)?;
                if held {
                    self.finish_segment(slot);
                }
            }
            return Ok(DmaOutcome::Triggered);
        }

        Ok(DmaOutcome::Nothing)
    }

    /// Kicks the burst for a configured slot. A trigger the FIFO is not
    /// ready for costs a retry and stays pending for the next cycle.
    pub(crate) fn trigger_dma(&mut self, slot: SlotIndex) -> Result<DmaOutcome, BridgeError> {
        let outcome = self.dispatch_dma(slot, DmaControl::TRIGGER)?;
        if outcome != DmaOutcome::Triggered {
            debug!(slot = %slot, ?outcome, "dma trigger deferred");
            if let RetryVerdict::Retry(_) = self.slots.note_retry(slot, self.cfg.max_retries) {
                self.slots.get_mut(slot).dma = DmaState::TriggerPending;
            }
        }
        Ok(outcome)
    }

    /// Applies the overflow policy to a freshly reloaded accumulator: the
    /// slot takes a retry, and both the accumulator and the hardware counter
    /// restart from zero.
    fn check_overflow(&mut self, slot: SlotIndex) -> Option<RetryVerdict> {
        let value = self.control.accumulator;
        if value < self.cfg.overflow_threshold {
            return None;
        }
        warn!(slot = %slot, value, "transfer accumulator overflow");
        let verdict = self.slots.note_retry(slot, self.cfg.max_retries);
        self.control.accumulator = 0;
        self.regs.write(Register::TransferCount, 0);
        Some(verdict)
    }
}
