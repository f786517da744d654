//! Error types for the bridge core.

use thiserror::Error;

use crate::regs::Register;
use crate::slot::{SlotIndex, SlotState};

/// A command block wrapper that failed validation. No slot is allocated and no
/// status is queued; stalling the endpoint is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CbwError {
    #[error("command block wrapper must be 31 bytes, got {len}")]
    Length { len: usize },
    #[error("invalid command block wrapper signature {found:02x?}")]
    Signature { found: [u8; 4] },
}

/// Errors reported while decoding a command status wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CswError {
    #[error("command status wrapper must be 13 bytes, got {len}")]
    Length { len: usize },
    #[error("invalid command status wrapper signature 0x{found:08X}")]
    Signature { found: u32 },
    #[error("the command status field is invalid, should be in 0..=2, was {status}")]
    Status { status: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    /// Every slot is in flight. Backpressure, not a failure.
    #[error("no idle transfer slot")]
    Exhausted,
    #[error("tag 0x{0:08X} already has an open command")]
    TagInUse(u32),
    #[error("slot {index} cannot be released while {state:?}")]
    IllegalRelease { index: SlotIndex, state: SlotState },
    #[error("slot {index} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        index: SlotIndex,
        from: SlotState,
        to: SlotState,
    },
    #[error("chain starting at slot {head} does not terminate")]
    CorruptChain { head: SlotIndex },
    #[error("slot {0} is not a chain head")]
    NotHead(SlotIndex),
}

impl SlotError {
    /// True when the caller should simply retry later.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, SlotError::Exhausted)
    }
}

/// A bounded busy-wait gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {attempts} polls of {register:?}")]
pub struct PollTimeout {
    pub register: Register,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Cbw(#[from] CbwError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Timeout(#[from] PollTimeout),
    #[error("slot {0} has not completed")]
    NotComplete(SlotIndex),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
