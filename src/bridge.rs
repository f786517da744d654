//! The bridge: owns the register access, the slot table and the control
//! block, and runs the control cycle that ties the USB, SCSI and NVMe sides
//! together.

use tracing::{debug, error, info, instrument, warn};

use crate::config::BridgeConfig;
use crate::control::{ControlBlock, ERROR_MARKERS};
use crate::dispatch::Dispatch;
use crate::dma::DmaState;
use crate::error::{BridgeError, SlotError};
use crate::nvme::{DrainReport, SubmissionRing, SyncRoute};
use crate::regs::{DeviceRegisters, Register};
use crate::scsi::command::ScsiCommand;
use crate::scsi::state::ControlState;
use crate::slot::{SLOT_COUNT, SlotIndex, SlotState, SlotTable};
use crate::usb::cbw::{CommandBlockWrapper, CommandStatus, CommandStatusWrapper};

/// What happened to a received command block wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The command owns this head slot.
    Admitted(SlotIndex),
    /// Not enough idle slots; resubmit once completions drain.
    Backpressure,
}

/// Summary of one control cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub state: Option<ControlState>,
    pub drained: DrainReport,
    pub sync: Option<SyncRoute>,
    /// Status wrappers sent to the host this cycle, in emission order.
    pub emitted: Vec<CommandStatusWrapper>,
}

pub struct Bridge<R, D> {
    pub(crate) regs: R,
    pub(crate) calls: D,
    pub(crate) slots: SlotTable,
    pub(crate) control: ControlBlock,
    pub(crate) ring: SubmissionRing,
    pub(crate) cfg: BridgeConfig,
}

impl<R: DeviceRegisters, D: Dispatch> Bridge<R, D> {
    pub fn new(regs: R, calls: D, cfg: BridgeConfig) -> Self {
        Self {
            regs,
            calls,
            slots: SlotTable::new(),
            control: ControlBlock::default(),
            ring: SubmissionRing::default(),
            cfg,
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    pub fn dispatch(&self) -> &D {
        &self.calls
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn control(&self) -> &ControlBlock {
        &self.control
    }

    /// The control block, for interrupt handlers that post state codes.
    pub fn control_mut(&mut self) -> &mut ControlBlock {
        &mut self.control
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    /// Posts a state code for the next control cycle.
    pub fn post_state(&mut self, state: ControlState, aux: u8) {
        self.control.state_code = state.code();
        self.control.aux_flag = aux;
    }

    /// Validates a received wrapper, claims slots for it and starts it.
    ///
    /// A wrapper that fails validation allocates nothing and queues no
    /// status; the caller stalls the endpoint.
    #[instrument(skip_all)]
    pub fn accept_cbw(&mut self, buf: &[u8]) -> Result<Admission, BridgeError> {
        let cbw = CommandBlockWrapper::parse(buf)?;
        let command = ScsiCommand::decode(cbw.command());
        let free = self.slots.iter().filter(|s| s.is_idle()).count();
        if free < self.slots_needed(&command).min(SLOT_COUNT) {
            debug!(tag = cbw.tag, free, "not enough idle slots");
            return Ok(Admission::Backpressure);
        }

        let head = match self
            .slots
            .allocate(cbw.tag, cbw.direction(), cbw.data_transfer_length)
        {
            Ok(head) => head,
            Err(err) if err.is_backpressure() => return Ok(Admission::Backpressure),
            Err(err) => return Err(err.into()),
        };
        self.slots.get_mut(head).lun = cbw.lun();
        self.control.work.set(ERROR_MARKERS, head.get(), 0);
        self.control.active_slot = Some(head);
        info!(tag = cbw.tag, slot = %head, ?command, "admitted");

        if self.slots_needed(&command) > SLOT_COUNT {
            warn!(tag = cbw.tag, "transfer needs more slots than the table holds");
            self.slots.transition(head, SlotState::CompleteError)?;
        } else {
            self.execute_command(head, command)?;
        }
        Ok(Admission::Admitted(head))
    }

    /// One pass of the control loop.
    pub fn run_cycle(&mut self) -> Result<CycleReport, BridgeError> {
        let state = self.step_state_machine()?;
        self.resume_pending()?;
        let drained = self.drain_completions();

        let mut emitted = Vec::new();
        let sync = match self.queue_sync() {
            Ok(SyncRoute::ControlDrain { slot, emitted: sent }) => {
                emitted.extend(sent.iter().copied());
                Some(SyncRoute::ControlDrain {
                    slot,
                    emitted: sent,
                })
            }
            Ok(route) => Some(route),
            Err(BridgeError::Timeout(timeout)) => {
                warn!(%timeout, "queue sync gave up");
                None
            }
            Err(err) => return Err(err),
        };
        emitted.extend(self.emit_settled()?);
        Ok(CycleReport {
            state,
            drained,
            sync,
            emitted,
        })
    }

    /// Restarts slots whose DMA setup or trigger was deferred.
    fn resume_pending(&mut self) -> Result<(), BridgeError> {
        let deferred: Vec<(SlotIndex, SlotState)> = self
            .slots
            .iter()
            .filter(|s| s.segment.is_some())
            .filter(|s| {
                s.state == SlotState::Pending
                    || (s.state == SlotState::DmaConfigured && s.dma == DmaState::TriggerPending)
            })
            .map(|s| (s.index(), s.state))
            .collect();
        for (slot, state) in deferred {
            if state == SlotState::Pending {
                debug!(slot = %slot, "retrying dma setup");
                self.start_segment(slot)?;
            } else {
                debug!(slot = %slot, "retrying dma trigger");
                self.trigger_dma(slot)?;
            }
        }
        Ok(())
    }

    /// Sends the status wrapper for a settled command and releases its chain.
    #[instrument(skip_all, fields(slot = %head))]
    pub fn emit_status(&mut self, head: SlotIndex) -> Result<CommandStatusWrapper, BridgeError> {
        if !self.slots.get(head).head {
            return Err(SlotError::NotHead(head).into());
        }
        let failed = match self.slots.chain_settled(head) {
            Ok(true) => self.slots.chain_failed(head)?,
            Ok(false) => return Err(BridgeError::NotComplete(head)),
            Err(SlotError::CorruptChain { .. }) => {
                error!(slot = %head, "corrupt chain, failing the command");
                let slot = self.slots.get_mut(head);
                slot.chain_next = None;
                self.slots.force_error(head);
                true
            }
            Err(err) => return Err(err.into()),
        };

        let slot = self.slots.get(head);
        let status = if failed {
            CommandStatus::Failed
        } else {
            CommandStatus::Passed
        };
        let residue = slot.residue.min(slot.requested_length);
        let csw = CommandStatusWrapper::new(slot.tag, residue, status);
        self.regs.write_bytes(Register::EndpointFifo, &csw.to_bytes());
        self.slots.release_chain(head)?;
        if self
            .control
            .active_slot
            .is_some_and(|a| self.slots.get(a).is_idle())
        {
            self.control.active_slot = None;
        }
        info!(tag = csw.tag, ?status, residue, "status sent");
        Ok(csw)
    }

    /// Emits status for every settled command.
    pub fn emit_settled(&mut self) -> Result<Vec<CommandStatusWrapper>, BridgeError> {
        let mut sent = Vec::new();
        for head in self.slots.settled_heads() {
            sent.push(self.emit_status(head)?);
        }
        Ok(sent)
    }

    /// Full device reset: clears every slot and the control block.
    pub fn reset(&mut self) {
        info!(in_flight = self.slots.in_flight(), "device reset");
        self.slots.reset();
        self.control.reset();
        self.ring = SubmissionRing::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CbwError;
    use crate::nvme::command::{NvmOpcode, SubmissionEntry};
    use crate::regs::{DMA_READY, FIFO_READY, FakeRegisters, LINK_READY};
    use crate::test_support::{TestBridge, bridge};
    use crate::usb::cbw::{CBW_SIZE, CSW_SIZE, Direction};

    fn ready() -> TestBridge {
        let mut b = bridge();
        b.regs
            .set(Register::TransferStatus, DMA_READY)
            .set(Register::FifoStatus, FIFO_READY)
            .set(Register::QueueIndex, 0xFF);
        b
    }

    fn read10(tag: u32, lba: u32, blocks: u16) -> [u8; CBW_SIZE] {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x28;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        CommandBlockWrapper::new(tag, blocks as u32 * 512, Direction::DeviceToHost, 0, &cdb)
            .to_bytes()
    }

    fn test_unit_ready(tag: u32) -> [u8; CBW_SIZE] {
        CommandBlockWrapper::new(tag, 0, Direction::HostToDevice, 0, &[0x00; 6]).to_bytes()
    }

    fn complete(regs: &mut FakeRegisters, indices: &[u8]) {
        let mut ready: Vec<u32> = indices.iter().map(|_| LINK_READY).collect();
        ready.push(0);
        regs.script(Register::LinkStatus, ready);
        regs.script(Register::QueueStatus, indices.iter().map(|i| *i as u32));
    }

    fn last_csw(b: &TestBridge) -> CommandStatusWrapper {
        let fifo = b.regs.bytes_written(Register::EndpointFifo);
        CommandStatusWrapper::parse(&fifo[fifo.len() - CSW_SIZE..]).unwrap()
    }

    #[test]
    fn read_round_trip_reports_zero_residue() {
        let mut b = ready();
        let head = match b.accept_cbw(&read10(0x1234_5678, 0x10, 8)).unwrap() {
            Admission::Admitted(head) => head,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(b.slots.get(head).state, SlotState::Active);
        let entry: [u8; 64] = b
            .regs
            .bytes_written(Register::SubmissionWindow)
            .try_into()
            .unwrap();
        let entry = SubmissionEntry::parse(&entry).unwrap();
        assert_eq!(entry.opcode, NvmOpcode::Read);
        assert_eq!((entry.slba, entry.blocks), (0x10, 8));

        complete(&mut b.regs, &[head.get()]);
        let report = b.run_cycle().unwrap();
        assert_eq!(report.drained.completed, vec![head]);
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(
                0x1234_5678,
                0,
                CommandStatus::Passed
            )]
        );
        assert_eq!(last_csw(&b).tag, 0x1234_5678);
        assert_eq!(b.slots.in_flight(), 0);
    }

    #[test]
    fn wrapper_fields_land_in_the_head_slot() {
        let mut b = ready();
        let Admission::Admitted(head) = b.accept_cbw(&read10(0x1122_3344, 0, 1)).unwrap() else {
            panic!("not admitted");
        };
        let slot = b.slots.get(head);
        assert_eq!(slot.tag, 0x1122_3344);
        assert_eq!(slot.direction, Direction::DeviceToHost);
        assert_eq!(slot.requested_length, 0x200);
        assert_eq!(b.slots.lookup_by_tag(0x1122_3344), Some(head));
    }

    #[test]
    fn bad_signature_allocates_nothing() {
        let mut b = ready();
        let mut buf = test_unit_ready(1);
        buf[0..4].copy_from_slice(b"USBX");
        let err = b.accept_cbw(&buf).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Cbw(CbwError::Signature { found }) if &found == b"USBX"
        ));
        assert_eq!(b.slots.in_flight(), 0);
        assert!(b.regs.log().is_empty());
        assert!(b.run_cycle().unwrap().emitted.is_empty());
    }

    #[test]
    fn short_wrapper_is_rejected() {
        let mut b = ready();
        let err = b.accept_cbw(&test_unit_ready(1)[..30]).unwrap_err();
        assert!(matches!(err, BridgeError::Cbw(CbwError::Length { len: 30 })));
    }

    #[test]
    fn thirty_third_command_waits_for_a_free_slot() {
        let mut b = ready();
        for tag in 0..32 {
            assert!(matches!(
                b.accept_cbw(&read10(tag, tag * 8, 8)).unwrap(),
                Admission::Admitted(_)
            ));
        }
        assert_eq!(
            b.accept_cbw(&read10(32, 0, 8)).unwrap(),
            Admission::Backpressure
        );

        complete(&mut b.regs, &[0]);
        let report = b.run_cycle().unwrap();
        assert_eq!(report.emitted.len(), 1);
        assert_eq!(
            b.accept_cbw(&read10(32, 0, 8)).unwrap(),
            Admission::Admitted(SlotIndex::new(0))
        );
    }

    #[test]
    fn duplicate_tag_is_refused() {
        let mut b = ready();
        b.accept_cbw(&read10(5, 0, 1)).unwrap();
        let err = b.accept_cbw(&read10(5, 8, 1)).unwrap_err();
        assert!(matches!(err, BridgeError::Slot(SlotError::TagInUse(5))));
    }

    #[test]
    fn local_commands_answer_without_nvme() {
        let mut b = ready();
        b.accept_cbw(&test_unit_ready(0xA)).unwrap();
        let report = b.run_cycle().unwrap();
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(0xA, 0, CommandStatus::Passed)]
        );
        assert!(b.regs.writes_to(Register::Doorbell).is_empty());
    }

    #[test]
    fn inquiry_sends_data_then_status() {
        let mut b = ready();
        let cbw = CommandBlockWrapper::new(7, 96, Direction::DeviceToHost, 0, &[0x12, 0, 0, 0, 96, 0]);
        b.accept_cbw(&cbw.to_bytes()).unwrap();
        b.run_cycle().unwrap();

        let fifo = b.regs.bytes_written(Register::EndpointFifo);
        assert_eq!(fifo.len(), 36 + CSW_SIZE);
        assert_eq!(&fifo[8..16], b"NVBRIDGE");
        let csw = last_csw(&b);
        assert_eq!(csw.data_residue, 96 - 36);
        assert_eq!(csw.status, CommandStatus::Passed);
    }

    #[test]
    fn unsupported_command_fails_with_full_residue() {
        let mut b = ready();
        let cbw = CommandBlockWrapper::new(3, 252, Direction::DeviceToHost, 0, &[0x23, 0, 0, 0, 0, 0, 0, 0, 0xFC, 0]);
        b.accept_cbw(&cbw.to_bytes()).unwrap();
        let report = b.run_cycle().unwrap();
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(3, 252, CommandStatus::Failed)]
        );
    }

    #[test]
    fn out_of_range_read_fails() {
        let mut b = ready();
        b.cfg.namespace_blocks = 16;
        b.accept_cbw(&read10(9, 12, 8)).unwrap();
        let report = b.run_cycle().unwrap();
        assert_eq!(report.emitted[0].status, CommandStatus::Failed);
        assert_eq!(report.emitted[0].data_residue, 8 * 512);
        assert!(b.regs.writes_to(Register::Doorbell).is_empty());
    }

    #[test]
    fn long_transfer_is_chained_and_reported_once() {
        let mut b = ready();
        b.cfg.max_blocks_per_command = 4;
        let head = match b.accept_cbw(&read10(0x77, 0, 10)).unwrap() {
            Admission::Admitted(head) => head,
            other => panic!("unexpected {other:?}"),
        };
        let chain = b.slots.chain(head).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(b.regs.writes_to(Register::Doorbell), vec![1, 2, 3]);
        assert_eq!(b.regs.writes_to(Register::DmaLength), vec![2048, 2048, 1024]);

        // Two of three segments complete: nothing is reported yet.
        complete(&mut b.regs, &[chain[0].get(), chain[2].get()]);
        assert!(b.run_cycle().unwrap().emitted.is_empty());
        assert_eq!(b.slots.get(head).residue, 4 * 512);

        complete(&mut b.regs, &[chain[1].get()]);
        let report = b.run_cycle().unwrap();
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(0x77, 0, CommandStatus::Passed)]
        );
        assert_eq!(b.slots.in_flight(), 0);
    }

    #[test]
    fn failed_segment_fails_the_whole_command() {
        let mut b = ready();
        b.cfg.max_blocks_per_command = 4;
        let Admission::Admitted(head) = b.accept_cbw(&read10(0x78, 0, 8)).unwrap() else {
            panic!("not admitted");
        };
        let chain = b.slots.chain(head).unwrap();
        b.control.work.set(ERROR_MARKERS, chain[1].get(), 0x02);
        complete(&mut b.regs, &[chain[0].get(), chain[1].get()]);
        let report = b.run_cycle().unwrap();
        assert_eq!(report.emitted[0].status, CommandStatus::Failed);
        assert_eq!(report.emitted[0].data_residue, 4 * 512);
    }

    #[test]
    fn busy_dma_engine_defers_then_recovers() {
        let mut b = ready();
        b.cfg.poll_attempts = 2;
        b.regs.script(Register::TransferStatus, [0, 0]);
        let Admission::Admitted(head) = b.accept_cbw(&read10(1, 0, 1)).unwrap() else {
            panic!("not admitted");
        };
        assert_eq!(b.slots.get(head).state, SlotState::Pending);
        assert!(b.regs.writes_to(Register::Doorbell).is_empty());

        b.run_cycle().unwrap();
        assert_eq!(b.slots.get(head).state, SlotState::Active);
        assert_eq!(b.regs.writes_to(Register::Doorbell), vec![1]);
    }

    #[test]
    fn fifo_not_ready_holds_status_until_the_burst_runs() {
        let mut b = ready();
        b.regs.set(Register::FifoStatus, 0);
        let Admission::Admitted(head) = b.accept_cbw(&read10(1, 0, 1)).unwrap() else {
            panic!("not admitted");
        };
        assert_eq!(b.slots.get(head).state, SlotState::DmaConfigured);
        assert_eq!(b.slots.get(head).dma, DmaState::TriggerPending);

        complete(&mut b.regs, &[head.get()]);
        let report = b.run_cycle().unwrap();
        assert!(report.emitted.is_empty());
        assert!(b.slots.get(head).completion_held);
        assert!(b.regs.writes_to(Register::DmaTrigger).is_empty());

        b.regs.set(Register::FifoStatus, FIFO_READY);
        let report = b.run_cycle().unwrap();
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(1, 0, CommandStatus::Passed)]
        );
        assert_eq!(b.regs.writes_to(Register::DmaTrigger).len(), 1);
    }

    #[test]
    fn fifo_that_never_readies_fails_the_command() {
        let mut b = ready();
        b.cfg.max_retries = 2;
        b.regs.set(Register::FifoStatus, 0);
        b.accept_cbw(&read10(2, 0, 1)).unwrap();
        assert!(b.run_cycle().unwrap().emitted.is_empty());
        let report = b.run_cycle().unwrap();
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(2, 512, CommandStatus::Failed)]
        );
        assert!(b.regs.writes_to(Register::DmaTrigger).is_empty());
    }

    #[test]
    fn completion_tag_mismatch_reports_failed() {
        let mut b = ready();
        let Admission::Admitted(head) = b.accept_cbw(&read10(0x31, 0, 1)).unwrap() else {
            panic!("not admitted");
        };
        b.slots.get_mut(head).submitted_tag = Some(0x32);
        complete(&mut b.regs, &[head.get()]);
        let report = b.run_cycle().unwrap();
        assert_eq!(
            report.emitted,
            vec![CommandStatusWrapper::new(0x31, 512, CommandStatus::Failed)]
        );
        assert_eq!(last_csw(&b).status, CommandStatus::Failed);
    }

    #[test]
    fn emitting_an_unsettled_command_is_refused() {
        let mut b = ready();
        let Admission::Admitted(head) = b.accept_cbw(&read10(1, 0, 1)).unwrap() else {
            panic!("not admitted");
        };
        assert!(matches!(
            b.emit_status(head),
            Err(BridgeError::NotComplete(h)) if h == head
        ));
    }

    #[test]
    fn corrupt_chain_is_failed_not_hung() {
        let mut b = ready();
        b.cfg.max_blocks_per_command = 1;
        let Admission::Admitted(head) = b.accept_cbw(&read10(0x99, 0, 2)).unwrap() else {
            panic!("not admitted");
        };
        let member = b.slots.get(head).chain_next.unwrap();
        b.slots.get_mut(member).chain_next = Some(head);
        b.slots.force_error(head);

        let csw = b.emit_status(head).unwrap();
        assert_eq!(csw.status, CommandStatus::Failed);
        assert!(b.slots.get(head).is_idle());
    }

    #[test]
    fn reset_clears_everything() {
        let mut b = ready();
        b.accept_cbw(&read10(1, 0, 1)).unwrap();
        b.post_state(ControlState::PowerCheck, 0);
        b.reset();
        assert_eq!(b.slots.in_flight(), 0);
        assert_eq!(b.control.state_code, 0);
        assert_eq!(b.ring.tail(), SlotIndex::new(0));
    }
}
