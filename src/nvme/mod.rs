//! The NVMe side of the bridge: submitting slot segments, draining
//! completions into the work table and synchronizing the queue index with
//! the SCSI layer.

pub mod command;

use tracing::{debug, trace, warn};

use crate::bridge::Bridge;
use crate::control::{COMPLETION_COUNTERS, ERROR_MARKERS, RESULT_FLAGS};
use crate::dispatch::{BankedCall, Dispatch};
use crate::error::{BridgeError, PollTimeout};
use crate::regs::{ACK_ALL, DeviceRegisters, LINK_IRQ_PENDING, LINK_READY, Register};
use crate::slot::{SLOT_COUNT, SlotIndex, SlotState};
use crate::usb::cbw::{CommandStatusWrapper, Direction};

use self::command::{NvmOpcode, SubmissionEntry};

/// Completions drained per pass at most.
pub const QUEUE_DEPTH: usize = SLOT_COUNT;
/// Completion index bits of [`Register::QueueStatus`].
pub const QUEUE_STATUS_INDEX: u32 = 0x3F;
/// Result flags written for every drained entry.
pub const RESULT_DONE: u8 = 0x01;
/// Set in the result flags when the entry's error marker is non-zero.
pub const RESULT_ERROR: u8 = 0x80;

/// Submission tail, advanced modulo the queue depth.
#[derive(Debug, Clone, Default)]
pub struct SubmissionRing {
    tail: SlotIndex,
    submitted: u64,
}

impl SubmissionRing {
    pub fn tail(&self) -> SlotIndex {
        self.tail
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries consumed from the completion path.
    pub processed: usize,
    /// Slots whose state changed because of a drained entry.
    pub completed: Vec<SlotIndex>,
    /// The pass stopped because the link dropped its ready bit.
    pub link_down: bool,
}

/// Where a queue sync routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRoute {
    /// No queue index was latched.
    Idle,
    /// The counter matched the stored reference; the state handler ran with
    /// this slot active.
    StateHandler(SlotIndex),
    /// The counter moved; the reference was updated and settled commands
    /// were reported.
    ControlDrain {
        slot: SlotIndex,
        emitted: Vec<CommandStatusWrapper>,
    },
}

impl<R: DeviceRegisters, D: Dispatch> Bridge<R, D> {
    /// Builds the submission entry for a configured slot, pushes it through
    /// the submission window and rings the doorbell with the new tail.
    pub fn submit(&mut self, slot: SlotIndex) -> Result<(), BridgeError> {
        let s = self.slots.get(slot);
        let Some(segment) = s.segment else {
            return Err(BridgeError::NotComplete(slot));
        };
        let opcode = match (segment.blocks, s.direction) {
            (0, _) => NvmOpcode::Flush,
            (_, Direction::DeviceToHost) => NvmOpcode::Read,
            (_, Direction::HostToDevice) => NvmOpcode::Write,
        };
        let tag = s.tag;
        let entry = SubmissionEntry::for_segment(opcode, slot.get() as u16, segment);

        self.control.work.set(ERROR_MARKERS, slot.get(), 0);
        self.regs
            .write_bytes(Register::SubmissionWindow, &entry.to_bytes());
        self.ring.tail = self.ring.tail.next();
        self.ring.submitted += 1;
        self.regs
            .write(Register::Doorbell, self.ring.tail.get() as u32);
        self.slots.get_mut(slot).submitted_tag = Some(tag);
        debug!(slot = %slot, ?opcode, lba = segment.lba, blocks = segment.blocks, "submitted");
        Ok(())
    }

    /// Drains up to [`QUEUE_DEPTH`] completions while the link reports ready.
    pub fn drain_completions(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        for _ in 0..QUEUE_DEPTH {
            if !self.regs.is_set(Register::LinkStatus, LINK_READY) {
                self.control.primary_status = 0;
                self.control.secondary_status = 0;
                report.link_down = true;
                break;
            }
            let index = (self.regs.read(Register::QueueStatus) & QUEUE_STATUS_INDEX) as u8;

            let call = if self.control.power_initialized {
                let trigger = self.regs.read(Register::QueueTrigger) as u8;
                BankedCall::QueueTrigger { index, trigger }
            } else {
                BankedCall::QueueInit { index }
            };
            self.calls.call(call, &mut self.control.work);

            let marker = self.control.work.error_marker(index);
            let flags = if marker != 0 {
                RESULT_DONE | RESULT_ERROR
            } else {
                RESULT_DONE
            };
            let work = &mut self.control.work;
            work.set(RESULT_FLAGS, index, flags);
            work.increment(COMPLETION_COUNTERS, index);
            self.regs.write(Register::QueueTrigger, ACK_ALL);

            self.control.primary_status = flags;
            self.control.secondary_status = marker;
            self.control.advance_primary_offset();
            report.processed += 1;
            trace!(index, flags, marker, "drained completion");

            if let Some(slot) = self.complete_entry(index, flags) {
                report.completed.push(slot);
            }
        }
        report
    }

    /// Applies one drained entry to its slot. Returns the slot if its state
    /// changed.
    fn complete_entry(&mut self, index: u8, flags: u8) -> Option<SlotIndex> {
        if index as usize >= SLOT_COUNT {
            warn!(index, "completion index outside the slot table");
            return None;
        }
        let slot = SlotIndex::new(index);
        let s = self.slots.get(slot);
        let awaiting = matches!(
            s.state,
            SlotState::DmaConfigured | SlotState::Active
        );
        let Some(submitted) = s.submitted_tag.filter(|_| awaiting) else {
            if s.is_idle() || s.state.is_complete() {
                debug!(slot = %slot, state = ?s.state, "stale completion ignored");
                return None;
            }
            warn!(slot = %slot, state = ?s.state, "completion for a slot never submitted");
            self.slots.force_error(slot);
            return Some(slot);
        };
        if !self.slots.reconcile(slot, submitted) {
            return Some(slot);
        }
        if flags & RESULT_ERROR != 0 {
            debug!(slot = %slot, "nvme reported an error");
            self.slots.force_error(slot);
            return Some(slot);
        }
        if self.slots.get(slot).state == SlotState::DmaConfigured {
            debug!(slot = %slot, "completion held until the dma burst starts");
            self.slots.get_mut(slot).completion_held = true;
            return None;
        }
        self.finish_segment(slot);
        Some(slot)
    }

    /// Completes a slot whose data moved and accounts its bytes.
    pub(crate) fn finish_segment(&mut self, slot: SlotIndex) {
        if let Err(err) = self.slots.transition(slot, SlotState::CompleteOk) {
            warn!(%err, "completion rejected");
            self.slots.force_error(slot);
            return;
        }
        self.account_segment(slot);
    }

    /// Completes the open command carrying `tag`, for completion paths keyed
    /// by tag rather than queue index. Returns false if no command carries it.
    pub fn complete_by_tag(&mut self, tag: u32, ok: bool) -> bool {
        let Some(head) = self.slots.lookup_by_tag(tag) else {
            warn!(tag, "completion for unknown tag");
            return false;
        };
        if !ok {
            self.slots.force_error(head);
        } else if self.slots.get(head).state == SlotState::DmaConfigured {
            self.slots.get_mut(head).completion_held = true;
        } else {
            self.finish_segment(head);
        }
        true
    }

    /// Subtracts a completed segment's bytes from the command's residue.
    fn account_segment(&mut self, slot: SlotIndex) {
        let s = self.slots.get(slot);
        let Some(segment) = s.segment else {
            return;
        };
        let bytes = u32::try_from(segment.blocks as u64 * self.cfg.block_size as u64)
            .unwrap_or(u32::MAX);
        let head = if s.head {
            Some(slot)
        } else {
            self.slots.lookup_by_tag(s.tag)
        };
        if !s.head {
            let member = self.slots.get_mut(slot);
            member.residue = member.requested_length.saturating_sub(bytes);
        }
        if let Some(head) = head {
            let h = self.slots.get_mut(head);
            h.residue = h.residue.saturating_sub(bytes);
        }
    }

    /// Services pending link interrupts, latches the queue index and routes
    /// to the state handler or the control drain.
    pub fn queue_sync(&mut self) -> Result<SyncRoute, BridgeError> {
        let mut passes = 0u32;
        while self.regs.is_set(Register::LinkControl, LINK_IRQ_PENDING) {
            if passes >= self.cfg.isr_retry_limit {
                return Err(PollTimeout {
                    register: Register::LinkControl,
                    attempts: passes,
                }
                .into());
            }
            self.calls
                .call(BankedCall::InterruptService, &mut self.control.work);
            passes += 1;
        }

        let raw = self.regs.read(Register::QueueIndex);
        self.regs.write(Register::QueueIndex, ACK_ALL);
        if raw == ACK_ALL {
            return Ok(SyncRoute::Idle);
        }
        let slot = SlotIndex::new(raw as u8);
        let counter = self.control.work.get(COMPLETION_COUNTERS, slot.get());
        if counter == self.slots.get(slot).sync_reference {
            self.control.active_slot = Some(slot);
            self.step_state_machine()?;
            Ok(SyncRoute::StateHandler(slot))
        } else {
            self.slots.get_mut(slot).sync_reference = counter;
            let emitted = self.emit_settled()?;
            Ok(SyncRoute::ControlDrain { slot, emitted })
        }
    }
}
