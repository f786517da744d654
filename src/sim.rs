//! A simulated bridge chip: USB endpoint, DMA engine and an NVMe controller
//! with one namespace, behind the [`DeviceRegisters`] interface.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, trace};

use crate::control::ERROR_MARKERS;
use crate::dispatch::FnTable;
use crate::nvme::command::{ENTRY_SIZE, NvmOpcode, SubmissionEntry};
use crate::regs::{
    ACK_ALL, DMA_READY, DeviceRegisters, FIFO_READY, LINK_READY, Register,
};

/// NVMe generic status: LBA out of range.
pub const STATUS_LBA_OUT_OF_RANGE: u8 = 0x80;
/// NVMe media error: unrecovered read error.
pub const STATUS_MEDIA_ERROR: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Completion {
    cid: u16,
    status: u8,
}

#[derive(Debug, Default)]
pub struct SimulatedDevice {
    latched: HashMap<Register, u32>,
    submission: Vec<u8>,
    queued: Vec<SubmissionEntry>,
    completions: VecDeque<Completion>,
    frames: Vec<Vec<u8>>,
    namespace_blocks: u64,
    failing: BTreeSet<u64>,
    executed: u64,
}

impl SimulatedDevice {
    pub fn new(namespace_blocks: u64) -> Self {
        let mut latched = HashMap::new();
        latched.insert(Register::QueueIndex, ACK_ALL);
        Self {
            latched,
            namespace_blocks,
            ..Default::default()
        }
    }

    /// Reads or writes touching `lba` complete with a media error.
    pub fn fail_lba(&mut self, lba: u64) {
        self.failing.insert(lba);
    }

    /// Byte frames sent toward the host since the last call, one per
    /// transfer.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }

    /// NVMe commands executed so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn execute(&mut self, entry: SubmissionEntry) -> Completion {
        self.executed += 1;
        let status = match entry.opcode {
            NvmOpcode::Flush => 0,
            NvmOpcode::Read | NvmOpcode::Write => {
                let end = entry.slba.saturating_add(entry.blocks as u64);
                if end > self.namespace_blocks {
                    STATUS_LBA_OUT_OF_RANGE
                } else if self.failing.range(entry.slba..end).next().is_some() {
                    STATUS_MEDIA_ERROR
                } else {
                    0
                }
            }
        };
        debug!(cid = entry.cid, opcode = ?entry.opcode, lba = entry.slba, blocks = entry.blocks, status, "nvme executed");
        Completion {
            cid: entry.cid,
            status,
        }
    }

    fn ring_doorbell(&mut self) {
        let queued = std::mem::take(&mut self.queued);
        for entry in queued {
            let completion = self.execute(entry);
            self.completions.push_back(completion);
        }
    }

    fn push_submission_byte(&mut self, byte: u8) {
        self.submission.push(byte);
        if self.submission.len() < ENTRY_SIZE {
            return;
        }
        let mut raw = [0u8; ENTRY_SIZE];
        raw.copy_from_slice(&self.submission);
        self.submission.clear();
        match SubmissionEntry::parse(&raw) {
            Some(entry) => self.queued.push(entry),
            None => debug!(opcode = raw[0], "ignoring unknown submission"),
        }
    }
}

impl DeviceRegisters for SimulatedDevice {
    fn read(&mut self, reg: Register) -> u32 {
        let front = self.completions.front();
        match reg {
            Register::LinkStatus => front.map_or(0, |_| LINK_READY),
            Register::QueueStatus => front.map_or(0, |c| c.cid as u32 & 0x3F),
            Register::QueueTrigger => front.map_or(0, |c| c.status as u32),
            Register::FifoStatus => FIFO_READY,
            Register::TransferStatus => DMA_READY,
            _ => self.latched.get(&reg).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, reg: Register, value: u32) {
        trace!(?reg, value, "write");
        match reg {
            Register::SubmissionWindow => self.push_submission_byte(value as u8),
            Register::Doorbell => self.ring_doorbell(),
            Register::QueueTrigger if value == ACK_ALL => {
                if let Some(done) = self.completions.pop_front() {
                    self.latched.insert(Register::QueueIndex, done.cid as u32);
                }
            }
            Register::EndpointFifo => self.frames.push(vec![value as u8]),
            _ => {
                self.latched.insert(reg, value);
            }
        }
    }

    fn write_bytes(&mut self, reg: Register, bytes: &[u8]) {
        match reg {
            Register::EndpointFifo => self.frames.push(bytes.to_vec()),
            _ => {
                for &b in bytes {
                    self.write(reg, b as u32);
                }
            }
        }
    }
}

/// Routines matching [`SimulatedDevice`]: power is up, the secondary poll is
/// always ready, and the completion trigger value is the NVMe status, copied
/// into the entry's error marker.
pub fn firmware_routines() -> FnTable {
    FnTable {
        power_check: |_, _| 1,
        secondary_poll: |_, _| 1,
        queue_trigger: |(index, trigger), work| {
            work.set(ERROR_MARKERS, index, trigger);
            0
        },
        queue_init: |index, work| {
            work.set(ERROR_MARKERS, index, 0);
            0
        },
        ..FnTable::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Admission, Bridge};
    use crate::config::BridgeConfig;
    use crate::scsi::state::ControlState;
    use crate::slot::Segment;
    use crate::usb::cbw::{
        CommandBlockWrapper, CommandStatus, CommandStatusWrapper, Direction,
    };

    fn submit(dev: &mut SimulatedDevice, cid: u16, lba: u64, blocks: u32) {
        let entry = SubmissionEntry::for_segment(NvmOpcode::Read, cid, Segment { lba, blocks });
        dev.write_bytes(Register::SubmissionWindow, &entry.to_bytes());
    }

    #[test]
    fn completions_appear_once_the_doorbell_rings() {
        let mut dev = SimulatedDevice::new(64);
        submit(&mut dev, 3, 0, 8);
        assert_eq!(dev.read(Register::LinkStatus), 0);

        dev.write(Register::Doorbell, 1);
        assert_eq!(dev.read(Register::LinkStatus), LINK_READY);
        assert_eq!(dev.read(Register::QueueStatus), 3);
        assert_eq!(dev.read(Register::QueueTrigger), 0);

        dev.write(Register::QueueTrigger, ACK_ALL);
        assert_eq!(dev.read(Register::LinkStatus), 0);
        assert_eq!(dev.read(Register::QueueIndex), 3);
    }

    #[test]
    fn bad_ranges_complete_with_errors() {
        let mut dev = SimulatedDevice::new(64);
        dev.fail_lba(10);
        submit(&mut dev, 0, 60, 8);
        submit(&mut dev, 1, 8, 4);
        dev.write(Register::Doorbell, 2);

        assert_eq!(dev.read(Register::QueueTrigger), STATUS_LBA_OUT_OF_RANGE as u32);
        dev.write(Register::QueueTrigger, ACK_ALL);
        assert_eq!(dev.read(Register::QueueTrigger), STATUS_MEDIA_ERROR as u32);
        assert_eq!(dev.executed(), 2);
    }

    fn read10(tag: u32, lba: u32, blocks: u16) -> [u8; 31] {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x28;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        CommandBlockWrapper::new(tag, blocks as u32 * 512, Direction::DeviceToHost, 0, &cdb)
            .to_bytes()
    }

    #[test]
    fn bridge_runs_against_the_simulated_chip() {
        let mut dev = SimulatedDevice::new(1024);
        dev.fail_lba(100);
        let mut bridge = Bridge::new(dev, firmware_routines(), BridgeConfig::default());
        bridge.post_state(ControlState::PowerCheck, 0);
        bridge.run_cycle().unwrap();
        assert!(bridge.control().power_initialized);

        assert!(matches!(
            bridge.accept_cbw(&read10(1, 0, 8)).unwrap(),
            Admission::Admitted(_)
        ));
        bridge.accept_cbw(&read10(2, 96, 8)).unwrap();
        let report = bridge.run_cycle().unwrap();

        let mut statuses: Vec<_> = report.emitted.iter().map(|c| (c.tag, c.status)).collect();
        statuses.sort_by_key(|(tag, _)| *tag);
        assert_eq!(
            statuses,
            vec![(1, CommandStatus::Passed), (2, CommandStatus::Failed)]
        );

        let frames = bridge.regs_mut().take_frames();
        let sent: Vec<_> = frames
            .iter()
            .filter_map(|f| CommandStatusWrapper::parse(f).ok())
            .collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(bridge.slots().in_flight(), 0);
    }
}
