//! Underlying structures that commands arrive in. Multi-byte CDB fields are
//! big endian.

/// Operation codes for a Command Descriptor Block, specifying what operation the
/// host wants, as described in 7.1 of SPC-2 and 5.1 of SBC-2.
///
/// This enum is not complete; opcodes outside it are answered with a failed
/// status.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1E,
    /// SBC-2 5.1.10, table 27
    ReadCapacity10 = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.21
    Write10 = 0x2A,
    /// SBC-2 5.1.17
    SynchronizeCache10 = 0x35,
    /// SBC-2 5.1.8
    Read16 = 0x88,
    /// SBC-2 5.1.23
    Write16 = 0x8A,
}

impl OpCode {
    pub fn from_byte(op: u8) -> Option<OpCode> {
        Some(match op {
            0x00 => OpCode::TestUnitReady,
            0x12 => OpCode::Inquiry,
            0x1E => OpCode::PreventAllowMediumRemoval,
            0x25 => OpCode::ReadCapacity10,
            0x28 => OpCode::Read10,
            0x2A => OpCode::Write10,
            0x35 => OpCode::SynchronizeCache10,
            0x88 => OpCode::Read16,
            0x8A => OpCode::Write16,
            _ => return None,
        })
    }
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct X6CommandDescriptor {
    pub operation_code: u8,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The top 3 bits of the first byte are reserved.
    pub logical_block_address: u32,
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH` (amount of
    /// data to be transferred, usually in blocks),
    /// `PARAMETER LIST LENGTH` (number of bytes sent from the Data-Out buffer),
    /// or `ALLOCATION LENGTH` (The maximum number of bytes a client has allocated for returned
    /// data).
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2."
    pub control: u8,
}

impl X6CommandDescriptor {
    pub const LEN: usize = 6;

    pub fn from_bytes(cdb: &[u8]) -> Option<Self> {
        let cdb: &[u8; Self::LEN] = cdb.get(..Self::LEN)?.try_into().ok()?;
        Some(Self {
            operation_code: cdb[0],
            logical_block_address: u32::from_be_bytes([0, cdb[1] & 0x1F, cdb[2], cdb[3]]),
            misc_len: cdb[4],
            control: cdb[5],
        })
    }
}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct X10CommandDescriptor {
    pub operation_code: u8,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field
    pub service_action: u8,
    pub logical_block_address: u32,
    /// Transfer, parameter list or allocation length, see [`X6CommandDescriptor::misc_len`].
    pub misc_len: u16,
    pub control: u8,
}

impl X10CommandDescriptor {
    pub const LEN: usize = 10;

    pub fn from_bytes(cdb: &[u8]) -> Option<Self> {
        let cdb: &[u8; Self::LEN] = cdb.get(..Self::LEN)?.try_into().ok()?;
        Some(Self {
            operation_code: cdb[0],
            service_action: cdb[1],
            logical_block_address: u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]),
            misc_len: u16::from_be_bytes([cdb[7], cdb[8]]),
            control: cdb[9],
        })
    }
}

/// "A command is communicated by sending a command descriptor block
/// to the device ...."
///
/// SPC-2 4.3.2, Table 4 -- Typical CDB for 16-byte commands
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct X16CommandDescriptor {
    pub operation_code: u8,
    /// "Miscellaneous CDB information" (last 5 bits)
    pub misc_info: u8,
    /// "The logical block addresses on a logical unit or within a volume partition
    /// shall begin with block zero and be contiguous up to the last logical
    /// block of that logical unit or within that partition."
    pub logical_block_address: u64,
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    ///
    /// "In commands that use multiple bytes for the `TRANSFER LENGTH` field, a transfer length
    /// of zero indicates that no data transfer shall take place."
    pub param: u32,
    pub control: u8,
}

impl X16CommandDescriptor {
    pub const LEN: usize = 16;

    pub fn from_bytes(cdb: &[u8]) -> Option<Self> {
        let cdb: &[u8; Self::LEN] = cdb.get(..Self::LEN)?.try_into().ok()?;
        let mut lba = [0u8; 8];
        lba.copy_from_slice(&cdb[2..10]);
        Some(Self {
            operation_code: cdb[0],
            misc_info: cdb[1],
            logical_block_address: u64::from_be_bytes(lba),
            param: u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
            control: cdb[15],
        })
    }
}
