//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//!
//! Media commands become chains of NVMe submissions; the rest are answered
//! from here.

pub mod command;
mod command_descriptor;
pub mod response;
pub mod state;

use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::dispatch::Dispatch;
use crate::dma::DmaSetup;
use crate::error::BridgeError;
use crate::nvme::command::MAX_BLOCKS;
use crate::regs::{DeviceRegisters, Register};
use crate::slot::{Segment, SlotIndex, SlotState};
use crate::usb::cbw::Direction;

use self::command::ScsiCommand;

pub const VENDOR: &[u8; 8] = b"NVBRIDGE";
pub const PRODUCT: &[u8; 16] = b"USB-NVMe Bridge ";
pub const REVISION: &[u8; 4] = b"0001";

/// Splits `blocks` starting at `lba` into runs of at most `per_command`.
pub fn split_segments(lba: u64, blocks: u32, per_command: u32) -> impl Iterator<Item = Segment> {
    let per_command = per_command.max(1);
    (0..blocks.div_ceil(per_command)).map(move |n| {
        let offset = n * per_command;
        Segment {
            lba: lba + offset as u64,
            blocks: (blocks - offset).min(per_command),
        }
    })
}

impl<R: DeviceRegisters, D: Dispatch> Bridge<R, D> {
    fn blocks_per_command(&self) -> u32 {
        self.cfg.max_blocks_per_command.clamp(1, MAX_BLOCKS)
    }

    /// Slots a command occupies once admitted.
    pub(crate) fn slots_needed(&self, command: &ScsiCommand) -> usize {
        match *command {
            ScsiCommand::Read { blocks, .. } | ScsiCommand::Write { blocks, .. } if blocks > 0 => {
                blocks.div_ceil(self.blocks_per_command()) as usize
            }
            _ => 1,
        }
    }

    /// Starts executing `command` on a freshly allocated head slot.
    pub(crate) fn execute_command(
        &mut self,
        head: SlotIndex,
        command: ScsiCommand,
    ) -> Result<(), BridgeError> {
        debug!(slot = %head, ?command, "executing");
        match command {
            ScsiCommand::TestUnitReady | ScsiCommand::PreventAllowMediumRemoval => {
                self.answer_locally(head, &[])
            }
            ScsiCommand::Inquiry { allocation_length } => {
                let data = response::inquiry(VENDOR, PRODUCT, REVISION);
                let len = data.len().min(allocation_length as usize);
                self.answer_locally(head, &data[..len])
            }
            ScsiCommand::ReadCapacity10 => {
                let data = response::read_capacity_10(self.cfg.namespace_blocks, self.cfg.block_size);
                self.answer_locally(head, &data)
            }
            ScsiCommand::Read { lba, blocks } => {
                self.start_media(head, Direction::DeviceToHost, lba, blocks)
            }
            ScsiCommand::Write { lba, blocks } => {
                self.start_media(head, Direction::HostToDevice, lba, blocks)
            }
            ScsiCommand::SynchronizeCache => {
                self.slots.get_mut(head).segment = Some(Segment { lba: 0, blocks: 0 });
                self.start_segment(head)
            }
            ScsiCommand::Unsupported(op) => {
                warn!(slot = %head, op, "unsupported command");
                self.fail_command(head)
            }
        }
    }

    /// Sends `data` toward the host and completes the command.
    fn answer_locally(&mut self, head: SlotIndex, data: &[u8]) -> Result<(), BridgeError> {
        let slot = self.slots.get(head);
        let len = match slot.direction {
            Direction::DeviceToHost => data.len().min(slot.requested_length as usize),
            Direction::HostToDevice => 0,
        };
        if len > 0 {
            self.regs.write_bytes(Register::EndpointFifo, &data[..len]);
        }
        let slot = self.slots.get_mut(head);
        slot.residue = slot.requested_length - len as u32;
        self.slots.transition(head, SlotState::CompleteOk)?;
        Ok(())
    }

    /// Fails the command without transferring data.
    fn fail_command(&mut self, head: SlotIndex) -> Result<(), BridgeError> {
        self.slots.transition(head, SlotState::CompleteError)?;
        Ok(())
    }

    fn start_media(
        &mut self,
        head: SlotIndex,
        direction: Direction,
        lba: u64,
        blocks: u32,
    ) -> Result<(), BridgeError> {
        let (wrapped, requested) = {
            let slot = self.slots.get(head);
            (slot.direction, slot.requested_length)
        };
        if blocks == 0 {
            return self.answer_locally(head, &[]);
        }
        let bytes = blocks as u64 * self.cfg.block_size as u64;
        let in_range = lba
            .checked_add(blocks as u64)
            .is_some_and(|end| end <= self.cfg.namespace_blocks);
        if !in_range {
            warn!(slot = %head, lba, blocks, "transfer outside the namespace");
            return self.fail_command(head);
        }
        if wrapped != direction || (requested as u64) < bytes {
            warn!(slot = %head, requested, bytes, "transfer does not match the wrapper");
            return self.fail_command(head);
        }

        let mut segments = split_segments(lba, blocks, self.blocks_per_command());
        self.slots.get_mut(head).segment = segments.next();
        for segment in segments {
            let len = segment.blocks * self.cfg.block_size;
            match self.slots.extend_chain(head, len) {
                Ok(member) => self.slots.get_mut(member).segment = Some(segment),
                Err(err) => {
                    warn!(slot = %head, %err, "cannot chain transfer");
                    self.fail_chain(head)?;
                    return Ok(());
                }
            }
        }
        for member in self.slots.chain(head)? {
            self.start_segment(member)?;
        }
        Ok(())
    }

    /// Programs DMA for a slot's segment, submits it and kicks the burst. A
    /// slot whose DMA engine stayed busy stays pending for the next cycle, as
    /// does a trigger the FIFO was not ready for.
    pub(crate) fn start_segment(&mut self, slot: SlotIndex) -> Result<(), BridgeError> {
        match self.configure_dma(slot)? {
            DmaSetup::Configured => {}
            DmaSetup::Retry(_) | DmaSetup::Failed => return Ok(()),
        }
        self.submit(slot)?;
        self.trigger_dma(slot)?;
        Ok(())
    }

    fn fail_chain(&mut self, head: SlotIndex) -> Result<(), BridgeError> {
        for member in self.slots.chain(head)? {
            self.slots.force_error(member);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cover_the_range() {
        let segments: Vec<_> = split_segments(100, 600, 256).collect();
        assert_eq!(
            segments,
            vec![
                Segment { lba: 100, blocks: 256 },
                Segment { lba: 356, blocks: 256 },
                Segment { lba: 612, blocks: 88 },
            ]
        );
        assert_eq!(split_segments(0, 0, 256).count(), 0);
        assert_eq!(split_segments(0, 3, 0).count(), 3);
    }
}
