//! The transfer slot table: 32 in-flight transfer records indexed by a
//! wrapping 5-bit queue index.

mod chain;

pub use chain::Chain;

use std::fmt;

use tracing::{debug, warn};

use crate::dma::DmaState;
use crate::error::SlotError;
use crate::usb::cbw::Direction;

/// Number of transfer slots. Queue index arithmetic is modulo this value.
pub const SLOT_COUNT: usize = 32;

/// A queue index, always in `0..32`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotIndex(u8);

impl SlotIndex {
    pub const MASK: u8 = (SLOT_COUNT - 1) as u8;

    /// Masks `raw` down to 5 bits.
    pub const fn new(raw: u8) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }

    fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Pending,
    DmaConfigured,
    Active,
    CompleteOk,
    CompleteError,
}

impl SlotState {
    pub fn is_complete(self) -> bool {
        matches!(self, SlotState::CompleteOk | SlotState::CompleteError)
    }

    fn can_become(self, to: SlotState) -> bool {
        use SlotState::*;
        match (self, to) {
            (Idle, Pending) => true,
            (Pending, DmaConfigured) => true,
            (DmaConfigured, Active) => true,
            (Pending | DmaConfigured | Active, CompleteOk) => true,
            (from, CompleteError) => from != Idle,
            (CompleteOk | CompleteError, Idle) => true,
            _ => false,
        }
    }
}

/// The part of a transfer carried by one NVMe command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub lba: u64,
    /// Block count, at least 1. Zero blocks means a flush.
    pub blocks: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSlot {
    index: SlotIndex,
    pub tag: u32,
    pub direction: Direction,
    pub requested_length: u32,
    pub residue: u32,
    pub retry_count: u8,
    pub state: SlotState,
    /// Next slot of the chain; `None` ends it.
    pub chain_next: Option<SlotIndex>,
    /// True for the slot that owns the command block wrapper.
    pub head: bool,
    pub lun: u8,
    pub segment: Option<Segment>,
    pub dma: DmaState,
    pub setup_done: bool,
    /// Tag recorded when the slot's NVMe entry was submitted.
    pub submitted_tag: Option<u32>,
    /// Completion counter value seen at the last queue sync.
    pub sync_reference: u8,
    /// The NVMe entry completed before the DMA burst was started.
    pub completion_held: bool,
}

impl TransferSlot {
    fn idle(index: SlotIndex) -> Self {
        Self {
            index,
            tag: 0,
            direction: Direction::HostToDevice,
            requested_length: 0,
            residue: 0,
            retry_count: 0,
            state: SlotState::Idle,
            chain_next: None,
            head: false,
            lun: 0,
            segment: None,
            dma: DmaState::Idle,
            setup_done: false,
            submitted_tag: None,
            sync_reference: 0,
            completion_held: false,
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }
}

/// Outcome of recording a retry against a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Keep going; carries the new retry count.
    Retry(u8),
    /// The retry budget is spent and the slot was failed.
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct SlotTable {
    slots: [TransferSlot; SLOT_COUNT],
    cursor: SlotIndex,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|i| TransferSlot::idle(SlotIndex::new(i as u8))),
            cursor: SlotIndex::default(),
        }
    }

    pub fn get(&self, index: SlotIndex) -> &TransferSlot {
        &self.slots[index.as_usize()]
    }

    pub fn get_mut(&mut self, index: SlotIndex) -> &mut TransferSlot {
        &mut self.slots[index.as_usize()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferSlot> {
        self.slots.iter()
    }

    /// Index the next allocation starts scanning from.
    pub fn cursor(&self) -> SlotIndex {
        self.cursor
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_idle()).count()
    }

    /// Claims the next idle slot for a new command.
    ///
    /// [`SlotError::Exhausted`] means every slot is in flight; the caller
    /// should retry once completions have drained.
    pub fn allocate(
        &mut self,
        tag: u32,
        direction: Direction,
        length: u32,
    ) -> Result<SlotIndex, SlotError> {
        if self.lookup_by_tag(tag).is_some() {
            return Err(SlotError::TagInUse(tag));
        }
        let index = self.claim(tag, direction, length)?;
        self.get_mut(index).head = true;
        debug!(slot = %index, tag, length, "allocated slot");
        Ok(index)
    }

    fn claim(&mut self, tag: u32, direction: Direction, length: u32) -> Result<SlotIndex, SlotError> {
        let mut candidate = self.cursor;
        for _ in 0..SLOT_COUNT {
            if self.get(candidate).is_idle() {
                *self.get_mut(candidate) = TransferSlot {
                    tag,
                    direction,
                    requested_length: length,
                    residue: length,
                    state: SlotState::Pending,
                    ..TransferSlot::idle(candidate)
                };
                self.cursor = candidate.next();
                return Ok(candidate);
            }
            candidate = candidate.next();
        }
        Err(SlotError::Exhausted)
    }

    /// Finds the open command carrying `tag`.
    pub fn lookup_by_tag(&self, tag: u32) -> Option<SlotIndex> {
        self.slots
            .iter()
            .find(|s| s.head && !s.is_idle() && s.tag == tag)
            .map(TransferSlot::index)
    }

    pub fn transition(&mut self, index: SlotIndex, to: SlotState) -> Result<(), SlotError> {
        let slot = self.get_mut(index);
        let from = slot.state;
        if !from.can_become(to) {
            return Err(SlotError::IllegalTransition { index, from, to });
        }
        slot.state = to;
        Ok(())
    }

    /// Fails a slot regardless of where it is in its lifecycle. Idle slots are
    /// left alone; returns whether the slot was failed.
    pub fn force_error(&mut self, index: SlotIndex) -> bool {
        let slot = self.get_mut(index);
        if slot.is_idle() {
            return false;
        }
        slot.state = SlotState::CompleteError;
        true
    }

    /// Returns a completed slot to idle. Releasing an idle slot does nothing.
    pub fn release(&mut self, index: SlotIndex) -> Result<(), SlotError> {
        let slot = self.get_mut(index);
        match slot.state {
            SlotState::Idle => Ok(()),
            SlotState::CompleteOk | SlotState::CompleteError => {
                *slot = TransferSlot::idle(index);
                Ok(())
            }
            state => Err(SlotError::IllegalRelease { index, state }),
        }
    }

    pub fn chain_matches(&self, index: SlotIndex, candidate_tag: u32) -> bool {
        self.get(index).tag == candidate_tag
    }

    /// Checks a completion's tag against the slot. On mismatch the slot is
    /// failed instead of being silently reused.
    pub fn reconcile(&mut self, index: SlotIndex, candidate_tag: u32) -> bool {
        if self.chain_matches(index, candidate_tag) {
            return true;
        }
        warn!(
            slot = %index,
            expected = self.get(index).tag,
            got = candidate_tag,
            "completion tag mismatch"
        );
        self.force_error(index);
        false
    }

    pub fn note_retry(&mut self, index: SlotIndex, max_retries: u8) -> RetryVerdict {
        let slot = self.get_mut(index);
        slot.retry_count = slot.retry_count.saturating_add(1);
        if slot.retry_count > max_retries {
            warn!(slot = %index, retries = slot.retry_count, "retry budget exhausted");
            self.force_error(index);
            return RetryVerdict::Exhausted;
        }
        RetryVerdict::Retry(slot.retry_count)
    }

    /// Full device reset.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
