//! Decoding of the SCSI commands the bridge understands.
//!
//! Media commands are forwarded to NVMe; a handful of housekeeping commands
//! are answered locally.

use super::command_descriptor::*;

/// A decoded SCSI command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScsiCommand {
    TestUnitReady,
    Inquiry { allocation_length: u16 },
    PreventAllowMediumRemoval,
    ReadCapacity10,
    Read { lba: u64, blocks: u32 },
    Write { lba: u64, blocks: u32 },
    SynchronizeCache,
    /// Opcode not handled, or a command block too short for its opcode.
    Unsupported(u8),
}

impl ScsiCommand {
    pub fn decode(cdb: &[u8]) -> ScsiCommand {
        let Some(&op) = cdb.first() else {
            return ScsiCommand::Unsupported(0xFF);
        };
        let Some(opcode) = OpCode::from_byte(op) else {
            return ScsiCommand::Unsupported(op);
        };
        let decoded = match opcode {
            OpCode::TestUnitReady => Some(ScsiCommand::TestUnitReady),
            OpCode::PreventAllowMediumRemoval => Some(ScsiCommand::PreventAllowMediumRemoval),
            OpCode::Inquiry => X6CommandDescriptor::from_bytes(cdb).map(|d| ScsiCommand::Inquiry {
                allocation_length: d.misc_len as u16,
            }),
            OpCode::ReadCapacity10 => Some(ScsiCommand::ReadCapacity10),
            OpCode::Read10 | OpCode::Write10 => X10CommandDescriptor::from_bytes(cdb).map(|d| {
                let (lba, blocks) = (d.logical_block_address as u64, d.misc_len as u32);
                if opcode == OpCode::Read10 {
                    ScsiCommand::Read { lba, blocks }
                } else {
                    ScsiCommand::Write { lba, blocks }
                }
            }),
            OpCode::Read16 | OpCode::Write16 => X16CommandDescriptor::from_bytes(cdb).map(|d| {
                let (lba, blocks) = (d.logical_block_address, d.param);
                if opcode == OpCode::Read16 {
                    ScsiCommand::Read { lba, blocks }
                } else {
                    ScsiCommand::Write { lba, blocks }
                }
            }),
            OpCode::SynchronizeCache10 => Some(ScsiCommand::SynchronizeCache),
        };
        decoded.unwrap_or(ScsiCommand::Unsupported(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read10_decodes_lba_and_length() {
        let cdb = [0x28, 0, 0, 0, 0x10, 0x00, 0, 0, 0x08, 0];
        assert_eq!(
            ScsiCommand::decode(&cdb),
            ScsiCommand::Read {
                lba: 0x1000,
                blocks: 8
            }
        );
    }

    #[test]
    fn write16_decodes_wide_fields() {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x8A;
        cdb[2..10].copy_from_slice(&0x1_0000_0000u64.to_be_bytes());
        cdb[10..14].copy_from_slice(&0x200u32.to_be_bytes());
        let cmd = ScsiCommand::decode(&cdb);
        assert_eq!(
            cmd,
            ScsiCommand::Write {
                lba: 0x1_0000_0000,
                blocks: 0x200
            }
        );
    }

    #[test]
    fn truncated_and_unknown_commands_are_unsupported() {
        assert_eq!(ScsiCommand::decode(&[0x28, 0, 0]), ScsiCommand::Unsupported(0x28));
        assert_eq!(ScsiCommand::decode(&[0x03]), ScsiCommand::Unsupported(0x03));
        assert_eq!(ScsiCommand::decode(&[]), ScsiCommand::Unsupported(0xFF));
    }

    #[test]
    fn inquiry_takes_allocation_length() {
        assert_eq!(
            ScsiCommand::decode(&[0x12, 0, 0, 0, 36, 0]),
            ScsiCommand::Inquiry {
                allocation_length: 36
            }
        );
    }
}
