//! NVM command set submission entries.

use crate::slot::Segment;

/// Size of a submission queue entry.
pub const ENTRY_SIZE: usize = 64;
/// The bridge exposes a single namespace.
pub const NAMESPACE_ID: u32 = 1;
/// Largest block count a single read or write can carry (NLB is 16 bits,
/// zero based).
pub const MAX_BLOCKS: u32 = 1 << 16;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvmOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
}

impl NvmOpcode {
    pub fn from_byte(op: u8) -> Option<NvmOpcode> {
        match op {
            0x00 => Some(NvmOpcode::Flush),
            0x01 => Some(NvmOpcode::Write),
            0x02 => Some(NvmOpcode::Read),
            _ => None,
        }
    }
}

/// One submission queue entry. Data pointers are left zero: the bridge's DMA
/// engine moves the payload, not the controller's PRP walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubmissionEntry {
    pub opcode: NvmOpcode,
    pub cid: u16,
    pub nsid: u32,
    pub slba: u64,
    /// Block count, one based. Ignored for flushes.
    pub blocks: u32,
}

impl SubmissionEntry {
    pub fn for_segment(opcode: NvmOpcode, cid: u16, segment: Segment) -> Self {
        Self {
            opcode,
            cid,
            nsid: NAMESPACE_ID,
            slba: segment.lba,
            blocks: segment.blocks,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        let dw0 = (self.cid as u32) << 16 | self.opcode as u32;
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        if self.opcode != NvmOpcode::Flush {
            out[40..44].copy_from_slice(&(self.slba as u32).to_le_bytes());
            out[44..48].copy_from_slice(&((self.slba >> 32) as u32).to_le_bytes());
            let nlb = self.blocks.saturating_sub(1) & 0xFFFF;
            out[48..52].copy_from_slice(&nlb.to_le_bytes());
        }
        out
    }

    /// Decodes an entry; `None` for opcodes outside the NVM subset used here.
    pub fn parse(bytes: &[u8; ENTRY_SIZE]) -> Option<Self> {
        let dw = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let opcode = NvmOpcode::from_byte(bytes[0])?;
        let (slba, blocks) = match opcode {
            NvmOpcode::Flush => (0, 0),
            _ => ((dw(44) as u64) << 32 | dw(40) as u64, (dw(48) & 0xFFFF) + 1),
        };
        Some(Self {
            opcode,
            cid: (dw(0) >> 16) as u16,
            nsid: dw(4),
            slba,
            blocks,
        })
    }
}
