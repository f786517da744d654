//! Shared control state: the status bytes and work table that interrupt
//! handlers, banked routines and the control cycle all read and write.

use crate::slot::SlotIndex;
use crate::usb::UsbMode;

/// A per-entry area of the work table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkArea {
    /// Result flags written by the completion drain.
    ResultFlags,
    /// Completion counters, incremented once per drained entry.
    CompletionCounters,
    /// Error markers. Non-zero means the entry completed with an error.
    ErrorMarkers,
}

impl WorkArea {
    /// Offset of the area in the firmware's scratch memory.
    pub const fn base(self) -> u8 {
        match self {
            WorkArea::ResultFlags => 0x08,
            WorkArea::CompletionCounters => 0x17,
            WorkArea::ErrorMarkers => 0x71,
        }
    }

    const fn row(self) -> usize {
        match self {
            WorkArea::ResultFlags => 0,
            WorkArea::CompletionCounters => 1,
            WorkArea::ErrorMarkers => 2,
        }
    }
}

pub const RESULT_FLAGS: WorkArea = WorkArea::ResultFlags;
pub const COMPLETION_COUNTERS: WorkArea = WorkArea::CompletionCounters;
pub const ERROR_MARKERS: WorkArea = WorkArea::ErrorMarkers;

/// Entries per area, one per completion index.
pub const AREA_ENTRIES: usize = 64;

/// Scratch table of per-entry bytes. Each area is its own table; indices
/// wrap within the area.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkTable([[u8; AREA_ENTRIES]; 3]);

impl Default for WorkTable {
    fn default() -> Self {
        Self([[0; AREA_ENTRIES]; 3])
    }
}

impl std::fmt::Debug for WorkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self.0.iter().flatten().filter(|b| **b != 0).count();
        f.debug_struct("WorkTable").field("non_zero", &used).finish()
    }
}

impl WorkTable {
    fn entry(&mut self, area: WorkArea, index: u8) -> &mut u8 {
        &mut self.0[area.row()][index as usize % AREA_ENTRIES]
    }

    pub fn get(&self, area: WorkArea, index: u8) -> u8 {
        self.0[area.row()][index as usize % AREA_ENTRIES]
    }

    pub fn set(&mut self, area: WorkArea, index: u8, value: u8) {
        *self.entry(area, index) = value;
    }

    /// Increments one entry, wrapping that entry only.
    pub fn increment(&mut self, area: WorkArea, index: u8) -> u8 {
        let entry = self.entry(area, index);
        *entry = entry.wrapping_add(1);
        *entry
    }

    pub fn error_marker(&self, index: u8) -> u8 {
        self.get(ERROR_MARKERS, index)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The control state evaluated once per control cycle.
#[derive(Debug, Clone, Default)]
pub struct ControlBlock {
    /// Current state code, consumed by the state machine.
    pub state_code: u8,
    /// Auxiliary selector for states that take one.
    pub aux_flag: u8,
    pub primary_status: u8,
    pub secondary_status: u8,
    /// Rolling 5-bit offset advanced once per drained completion.
    pub primary_offset: u8,
    pub power_initialized: bool,
    pub usb_mode: UsbMode,
    /// 32-bit transfer accumulator.
    pub accumulator: u32,
    /// Slot the per-slot handlers operate on.
    pub active_slot: Option<SlotIndex>,
    pub work: WorkTable,
}

impl ControlBlock {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn advance_primary_offset(&mut self) {
        self.primary_offset = (self.primary_offset + 1) & SlotIndex::MASK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_wrap_per_entry() {
        let mut work = WorkTable::default();
        work.set(COMPLETION_COUNTERS, 3, 0xFF);
        assert_eq!(work.increment(COMPLETION_COUNTERS, 3), 0);
        assert_eq!(work.get(COMPLETION_COUNTERS, 4), 0);
    }

    #[test]
    fn areas_do_not_share_entries() {
        let mut work = WorkTable::default();
        work.set(RESULT_FLAGS, 16, 0x81);
        work.set(ERROR_MARKERS, 0, 0x0C);
        assert_eq!(work.get(COMPLETION_COUNTERS, 1), 0);
        assert_eq!(work.get(COMPLETION_COUNTERS, 16), 0);
        assert_eq!(work.get(RESULT_FLAGS, 16), 0x81);
        assert_eq!(work.error_marker(0), 0x0C);
    }

    #[test]
    fn indices_wrap_within_an_area() {
        let mut work = WorkTable::default();
        work.set(ERROR_MARKERS, 0x45, 9);
        assert_eq!(work.error_marker(0x05), 9);
        assert_eq!(WorkArea::ErrorMarkers.base(), 0x71);
    }

    #[test]
    fn primary_offset_rolls_at_32() {
        let mut control = ControlBlock {
            primary_offset: 31,
            ..Default::default()
        };
        control.advance_primary_offset();
        assert_eq!(control.primary_offset, 0);
    }
}
