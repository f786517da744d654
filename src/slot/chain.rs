//! Chains of slots that carry one transfer split across several NVMe
//! commands.

use tracing::debug;

use super::{SLOT_COUNT, SlotIndex, SlotState, SlotTable};
use crate::error::SlotError;

/// Walks a chain from its head. Stops at the end-of-chain sentinel, or after
/// [`SLOT_COUNT`] steps in case the links are corrupted.
#[derive(Debug, Clone)]
pub struct Chain<'a> {
    table: &'a SlotTable,
    next: Option<SlotIndex>,
    steps: usize,
}

impl<'a> Chain<'a> {
    /// True if the walk stopped on the step bound rather than the sentinel.
    pub fn overran(&self) -> bool {
        self.next.is_some() && self.steps >= SLOT_COUNT
    }
}

impl Iterator for Chain<'_> {
    type Item = SlotIndex;

    fn next(&mut self) -> Option<SlotIndex> {
        if self.steps >= SLOT_COUNT {
            return None;
        }
        let current = self.next?;
        self.steps += 1;
        self.next = self.table.get(current).chain_next;
        Some(current)
    }
}

impl SlotTable {
    pub fn walk(&self, head: SlotIndex) -> Chain<'_> {
        Chain {
            table: self,
            next: Some(head),
            steps: 0,
        }
    }

    /// Members of the chain starting at `head`, head first.
    pub fn chain(&self, head: SlotIndex) -> Result<Vec<SlotIndex>, SlotError> {
        let mut walk = self.walk(head);
        let members: Vec<_> = walk.by_ref().collect();
        if walk.overran() {
            return Err(SlotError::CorruptChain { head });
        }
        Ok(members)
    }

    /// Allocates a follow-on slot for the command owned by `head` and links
    /// it at the end of the chain.
    pub fn extend_chain(&mut self, head: SlotIndex, length: u32) -> Result<SlotIndex, SlotError> {
        let owner = self.get(head);
        if !owner.head || owner.is_idle() {
            return Err(SlotError::NotHead(head));
        }
        let (tag, direction, lun) = (owner.tag, owner.direction, owner.lun);
        let tail = *self.chain(head)?.last().unwrap_or(&head);

        let index = self.claim(tag, direction, length)?;
        self.get_mut(index).lun = lun;
        self.get_mut(tail).chain_next = Some(index);
        debug!(head = %head, slot = %index, length, "extended chain");
        Ok(index)
    }

    /// True once every member of the chain has completed.
    pub fn chain_settled(&self, head: SlotIndex) -> Result<bool, SlotError> {
        Ok(self
            .chain(head)?
            .into_iter()
            .all(|i| self.get(i).state.is_complete()))
    }

    /// True if any member of the chain completed with an error.
    pub fn chain_failed(&self, head: SlotIndex) -> Result<bool, SlotError> {
        Ok(self
            .chain(head)?
            .into_iter()
            .any(|i| self.get(i).state == SlotState::CompleteError))
    }

    /// Releases every member of a settled chain.
    pub fn release_chain(&mut self, head: SlotIndex) -> Result<(), SlotError> {
        // Validate the whole chain before touching any member.
        let members = self.chain(head)?;
        if let Some(&open) = members.iter().find(|i| !self.get(**i).state.is_complete()) {
            return Err(SlotError::IllegalRelease {
                index: open,
                state: self.get(open).state,
            });
        }
        for index in members {
            self.release(index)?;
        }
        Ok(())
    }

    /// Heads whose chains have fully completed, in index order.
    pub fn settled_heads(&self) -> Vec<SlotIndex> {
        self.iter()
            .filter(|s| s.head && s.state.is_complete())
            .map(|s| s.index())
            .filter(|&i| self.chain_settled(i).unwrap_or(true))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::cbw::Direction;

    #[test]
    fn chain_links_in_allocation_order() {
        let mut table = SlotTable::new();
        let head = table.allocate(0x55, Direction::DeviceToHost, 4096).unwrap();
        let second = table.extend_chain(head, 2048).unwrap();
        let third = table.extend_chain(head, 2048).unwrap();

        assert_eq!(table.chain(head).unwrap(), vec![head, second, third]);
        assert!(!table.get(second).head);
        assert_eq!(table.get(third).tag, 0x55);
        assert_eq!(table.lookup_by_tag(0x55), Some(head));
    }

    #[test]
    fn sentinel_terminated_chains_end_within_bound() {
        let mut table = SlotTable::new();
        let head = table.allocate(1, Direction::HostToDevice, 0).unwrap();
        for _ in 0..31 {
            table.extend_chain(head, 0).unwrap();
        }
        assert_eq!(table.walk(head).count(), SLOT_COUNT);
        assert_eq!(table.chain(head).unwrap().len(), SLOT_COUNT);
    }

    #[test]
    fn cyclic_chain_is_reported_corrupt() {
        let mut table = SlotTable::new();
        let head = table.allocate(1, Direction::HostToDevice, 0).unwrap();
        let second = table.extend_chain(head, 0).unwrap();
        table.get_mut(second).chain_next = Some(head);

        assert_eq!(table.walk(head).count(), SLOT_COUNT);
        assert_eq!(table.chain(head), Err(SlotError::CorruptChain { head }));
    }

    #[test]
    fn settled_only_when_every_member_completes() {
        let mut table = SlotTable::new();
        let head = table.allocate(9, Direction::DeviceToHost, 1024).unwrap();
        let tail = table.extend_chain(head, 512).unwrap();

        table.transition(head, SlotState::CompleteOk).unwrap();
        assert!(!table.chain_settled(head).unwrap());
        assert!(table.settled_heads().is_empty());
        assert!(table.release_chain(head).is_err());
        assert_eq!(table.get(head).state, SlotState::CompleteOk);

        table.force_error(tail);
        assert!(table.chain_settled(head).unwrap());
        assert!(table.chain_failed(head).unwrap());
        assert_eq!(table.settled_heads(), vec![head]);

        table.release_chain(head).unwrap();
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn only_heads_can_be_extended() {
        let mut table = SlotTable::new();
        let head = table.allocate(3, Direction::DeviceToHost, 0).unwrap();
        let member = table.extend_chain(head, 0).unwrap();
        assert_eq!(table.extend_chain(member, 0), Err(SlotError::NotHead(member)));
        assert_eq!(
            table.extend_chain(SlotIndex::new(20), 0),
            Err(SlotError::NotHead(SlotIndex::new(20)))
        );
    }
}
