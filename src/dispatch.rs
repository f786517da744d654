//! Calls into routines that live outside the bridge core.
//!
//! On the target chip these routines sit in other memory banks and are
//! reached through a bank-switching trampoline. Here they are an enum-indexed
//! [`Dispatch`] trait; [`FnTable`] binds it to plain function pointers.

use crate::control::WorkTable;
use crate::slot::SlotIndex;

/// A routine the core delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankedCall {
    /// Power check, given the rolling primary-status offset. Non-zero means
    /// power is up.
    PowerCheck { offset: u8 },
    /// Descriptor parse, optionally narrowed by a sub-selector.
    ParseDescriptor { selector: Option<u8> },
    /// DMA status check for a slot. Non-zero is latched as the slot's DMA
    /// status.
    DmaStatusCheck { slot: SlotIndex },
    /// Secondary readiness poll before a DMA burst. Zero means not ready.
    SecondaryPoll,
    /// Completion routing once power is initialized, given the queue trigger
    /// value.
    QueueTrigger { index: u8, trigger: u8 },
    /// Completion routing during initialization.
    QueueInit { index: u8 },
    /// Interrupt service for a pending link interrupt.
    InterruptService,
}

/// Bank dispatch. Routines may read and update the shared work table.
pub trait Dispatch {
    fn call(&mut self, call: BankedCall, work: &mut WorkTable) -> u8;
}

type Routine<A> = fn(A, &mut WorkTable) -> u8;

fn nothing<A>(_: A, _: &mut WorkTable) -> u8 {
    0
}

/// Function-pointer table, one entry per routine.
#[derive(Debug, Clone, Copy)]
pub struct FnTable {
    pub power_check: Routine<u8>,
    pub parse_descriptor: Routine<Option<u8>>,
    pub dma_status_check: Routine<SlotIndex>,
    pub secondary_poll: Routine<()>,
    pub queue_trigger: Routine<(u8, u8)>,
    pub queue_init: Routine<u8>,
    pub interrupt_service: Routine<()>,
}

impl Default for FnTable {
    /// Every routine reports zero.
    fn default() -> Self {
        Self {
            power_check: nothing,
            parse_descriptor: nothing,
            dma_status_check: nothing,
            secondary_poll: nothing,
            queue_trigger: nothing,
            queue_init: nothing,
            interrupt_service: nothing,
        }
    }
}

impl Dispatch for FnTable {
    fn call(&mut self, call: BankedCall, work: &mut WorkTable) -> u8 {
        match call {
            BankedCall::PowerCheck { offset } => (self.power_check)(offset, work),
            BankedCall::ParseDescriptor { selector } => (self.parse_descriptor)(selector, work),
            BankedCall::DmaStatusCheck { slot } => (self.dma_status_check)(slot, work),
            BankedCall::SecondaryPoll => (self.secondary_poll)((), work),
            BankedCall::QueueTrigger { index, trigger } => {
                (self.queue_trigger)((index, trigger), work)
            }
            BankedCall::QueueInit { index } => (self.queue_init)(index, work),
            BankedCall::InterruptService => (self.interrupt_service)((), work),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ERROR_MARKERS;

    #[test]
    fn table_routes_to_the_matching_entry() {
        let mut table = FnTable {
            secondary_poll: |_, _| 1,
            queue_init: |index, work| {
                work.set(ERROR_MARKERS, index, 0x04);
                0
            },
            ..FnTable::default()
        };
        let mut work = WorkTable::default();

        assert_eq!(table.call(BankedCall::SecondaryPoll, &mut work), 1);
        assert_eq!(table.call(BankedCall::InterruptService, &mut work), 0);
        table.call(BankedCall::QueueInit { index: 5 }, &mut work);
        assert_eq!(work.error_marker(5), 0x04);
    }
}
