//! Command block wrapper and command status wrapper codec.
//!
//! See USB Mass Storage Class - Bulk Only Transport, sections 5.1 and 5.2.

use crate::error::{CbwError, CswError};

/// Signature that identifies a packet as a CBW (`"USBC"`).
///
/// This packet contains the below magic number (little endian).
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW (`"USBS"`).
///
/// The packet will start with the below magic number (little endian).
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size.
pub const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size.
pub const CSW_SIZE: usize = 13;
/// Longest command block a CBW can carry.
pub const MAX_CDB_SIZE: usize = 16;

/// Bit 7 of `bmCBWFlags`.
const DIRECTION_IN: u8 = 0x80;
/// Only the low nibble of `bCBWLUN` is significant.
const LUN_MASK: u8 = 0x0F;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Direction {
    /// Data-Out: from host to the device
    #[default]
    HostToDevice,
    /// Data-In: from the device to the host
    DeviceToHost,
}

/// The CBW wraps a SCSI command.
///
/// The CBW is always exactly 31 bytes in size, and in little endian format.
/// The flags and LUN bytes are kept as received so a decoded wrapper encodes
/// back to the same bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    /// `dCBWTag` - "A Command Block Tag sent by the host. The device shall echo
    /// the contents of this field back to the host in the [tag] field of the associated CSW.
    /// The [tag] positively associates a CSW with the corresponding CBW"
    pub tag: u32,
    /// `dCBWDataTransferLength` - "The number of bytes that the host expects
    /// to transfer on the Bulk-In or Bulk-Out endpoint (as indicated by the
    /// *Direction* bit) during the execution of this command. If this field
    /// is zero, the device and the host shall transfer no data between the CBW
    /// and associated CSW, and the device shall ignore the value of the *Direction*
    /// bit in *bmCBWFlags*."
    pub data_transfer_length: u32,
    /// `bmCBWFlags` - bit 7 is the direction, the rest are reserved.
    flags: u8,
    /// `bCBWLUN` - "The device Logical Unit Number (LUN) to which the command block
    /// is being sent." The top four bits are reserved.
    lun: u8,
    /// `bCBWCBLength` - "The valid length of the *CBWCB* in bytes. This defines the
    /// valid length of the command block. The only legal values are 1 through 16
    /// (01h through 10h). All other values are reserved."
    pub command_block_length: u8,
    /// `CBWCB` - "The command block to be executed by the device. [...] The device
    /// shall ignore the content of *CBWCB* field past the offset
    /// (15 + *bCBWCBLength* - 1)."
    pub command: [u8; MAX_CDB_SIZE],
}

impl CommandBlockWrapper {
    /// Builds a wrapper, as a host would before sending it.
    pub fn new(
        tag: u32,
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        command: &[u8],
    ) -> Self {
        let len = command.len().min(MAX_CDB_SIZE);
        let mut cdb = [0u8; MAX_CDB_SIZE];
        cdb[..len].copy_from_slice(&command[..len]);
        Self {
            tag,
            data_transfer_length,
            flags: match direction {
                Direction::DeviceToHost => DIRECTION_IN,
                Direction::HostToDevice => 0,
            },
            lun: lun & LUN_MASK,
            command_block_length: len as u8,
            command: cdb,
        }
    }

    /// Decodes a received packet. Fails unless it is exactly [`CBW_SIZE`] bytes
    /// and starts with [`CBW_SIGNATURE`].
    pub fn parse(buf: &[u8]) -> Result<Self, CbwError> {
        let buf: &[u8; CBW_SIZE] = buf
            .try_into()
            .map_err(|_| CbwError::Length { len: buf.len() })?;
        let signature = [buf[0], buf[1], buf[2], buf[3]];
        if u32::from_le_bytes(signature) != CBW_SIGNATURE {
            return Err(CbwError::Signature { found: signature });
        }

        let mut command = [0u8; MAX_CDB_SIZE];
        command.copy_from_slice(&buf[15..31]);
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_transfer_length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[12],
            lun: buf[13],
            command_block_length: buf[14],
            command,
        })
    }

    /// Serializes into exactly [`CBW_SIZE`] bytes.
    pub fn to_bytes(&self) -> [u8; CBW_SIZE] {
        let mut buf = [0u8; CBW_SIZE];
        buf[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        buf[12] = self.flags;
        buf[13] = self.lun;
        buf[14] = self.command_block_length;
        buf[15..31].copy_from_slice(&self.command);
        buf
    }

    pub fn direction(&self) -> Direction {
        if self.flags & DIRECTION_IN != 0 {
            Direction::DeviceToHost
        } else {
            Direction::HostToDevice
        }
    }

    pub fn lun(&self) -> u8 {
        self.lun & LUN_MASK
    }

    /// The significant bytes of the command block.
    pub fn command(&self) -> &[u8] {
        let len = (self.command_block_length as usize).min(MAX_CDB_SIZE);
        &self.command[..len]
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

impl TryFrom<u8> for CommandStatus {
    type Error = CswError;

    fn try_from(status: u8) -> Result<Self, CswError> {
        match status {
            0 => Ok(CommandStatus::Passed),
            1 => Ok(CommandStatus::Failed),
            2 => Ok(CommandStatus::PhaseError),
            _ => Err(CswError::Status { status }),
        }
    }
}

/// A packet containing the status/return value of a command block executed by the USB device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// `dCSWTag` - "The device shall set this field to the value received in the *dCBWTag* of
    /// the associated CBW."
    pub tag: u32,
    /// `dCSWDataResidue` - the difference between the amount of data expected as stated in
    /// the *dCBWDataTransferLength* and the amount actually processed. "The
    /// *dCSWDataResidue* shall not exceed the value sent in the *dCBWDataTransferLength*."
    pub data_residue: u32,
    /// `bCSWStatus`
    ///
    /// | Value | Description                    |
    /// | ----- | ------------------------------ |
    /// | 0x00  | Command Passed ("good status") |
    /// | 0x01  | Command Failed                 |
    /// | 0x02  | Phase Error                    |
    /// | _     | All other values are reserved  |
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn new(tag: u32, data_residue: u32, status: CommandStatus) -> Self {
        Self {
            tag,
            data_residue,
            status,
        }
    }

    pub fn to_bytes(&self) -> [u8; CSW_SIZE] {
        let mut buf = [0u8; CSW_SIZE];
        buf[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        buf[12] = self.status as u8;
        buf
    }

    /// Decodes a status packet, validating its size, signature and status byte.
    pub fn parse(buf: &[u8]) -> Result<Self, CswError> {
        let buf: &[u8; CSW_SIZE] = buf
            .try_into()
            .map_err(|_| CswError::Length { len: buf.len() })?;
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return Err(CswError::Signature { found: signature });
        }
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status: CommandStatus::try_from(buf[12])?,
        })
    }
}

/// Used for generating unique-ish command block tags.
#[derive(Debug)]
pub struct TagGenerator(u32);

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagGenerator {
    /// Initialize the tag generator.
    pub fn new() -> TagGenerator {
        // 123 was chosen as a distinct, human-readable pattern to differentiate it from the rest
        // of the packet
        Self(123)
    }

    /// Returns a unique-ish u32 that's different from the previously returned value.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read10_cbw() -> [u8; CBW_SIZE] {
        let mut raw = [0u8; CBW_SIZE];
        raw[0..4].copy_from_slice(b"USBC");
        raw[4..8].copy_from_slice(&0x1122_3344u32.to_le_bytes());
        raw[8..12].copy_from_slice(&0x200u32.to_le_bytes());
        raw[12] = 0x80;
        raw[13] = 0x00;
        raw[14] = 10;
        raw[15] = 0x28;
        raw[23] = 0x01;
        raw
    }

    #[test]
    fn decodes_fields() {
        let cbw = CommandBlockWrapper::parse(&read10_cbw()).unwrap();
        assert_eq!(cbw.tag, 0x1122_3344);
        assert_eq!(cbw.data_transfer_length, 512);
        assert_eq!(cbw.direction(), Direction::DeviceToHost);
        assert_eq!(cbw.command().len(), 10);
        assert_eq!(cbw.command()[0], 0x28);
    }

    #[test]
    fn reencodes_byte_exactly() {
        // Reserved flag bits and LUN high nibble survive a decode.
        let mut raw = read10_cbw();
        raw[12] = 0x85;
        raw[13] = 0xA3;
        raw[30] = 0xEE;
        let cbw = CommandBlockWrapper::parse(&raw).unwrap();
        assert_eq!(cbw.lun(), 3);
        assert_eq!(cbw.to_bytes(), raw);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut raw = read10_cbw();
        raw[0..4].copy_from_slice(b"USBX");
        assert_eq!(
            CommandBlockWrapper::parse(&raw),
            Err(CbwError::Signature { found: *b"USBX" })
        );
    }

    #[test]
    fn rejects_bad_length() {
        let raw = read10_cbw();
        assert_eq!(
            CommandBlockWrapper::parse(&raw[..30]),
            Err(CbwError::Length { len: 30 })
        );
        let mut long = raw.to_vec();
        long.push(0);
        assert_eq!(
            CommandBlockWrapper::parse(&long),
            Err(CbwError::Length { len: 32 })
        );
    }

    #[test]
    fn builds_passed_status() {
        let csw = CommandStatusWrapper::new(0xDEAD_BEEF, 0, CommandStatus::Passed);
        assert_eq!(
            csw.to_bytes(),
            [
                0x55, 0x53, 0x42, 0x53, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn catch_invalid_status_byte() {
        // Captured from an actual USB device, with the last byte (command_status) modified to
        // an invalid value (0xaa)
        let input_packet = [0x55, 0x53, 0x42, 0x53, 0, 0, 0, 0, 0, 0, 0, 0, 0xaa];
        let e = CommandStatusWrapper::parse(&input_packet).expect_err("should catch invalid command status");
        assert!(e.to_string().contains("command status"));
    }

    #[test]
    fn new_masks_lun_and_truncates_command() {
        let cbw = CommandBlockWrapper::new(1, 0, Direction::HostToDevice, 0x1F, &[0u8; 20]);
        assert_eq!(cbw.lun(), 0x0F);
        assert_eq!(cbw.command_block_length, 16);
        assert_eq!(CommandBlockWrapper::parse(&cbw.to_bytes()), Ok(cbw));
    }
}
