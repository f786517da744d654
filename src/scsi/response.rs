//! Response data for the SCSI commands answered without touching NVMe.

/// Standard INQUIRY data is at least 36 bytes (SPC-2 table 46).
pub const INQUIRY_LEN: usize = 36;
/// READ CAPACITY (10) parameter data (SBC-2 table 28).
pub const READ_CAPACITY_10_LEN: usize = 8;

/// Standard INQUIRY data for a direct access block device.
///
/// Byte 0 holds the PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE
/// TYPE (bits 4:0) fields; both are zero: a connected direct access device.
pub fn inquiry(vendor: &[u8; 8], product: &[u8; 16], revision: &[u8; 4]) -> [u8; INQUIRY_LEN] {
    let mut data = [0u8; INQUIRY_LEN];
    // RMB: removable medium.
    data[1] = 0x80;
    // VERSION: SPC-2.
    data[2] = 0x04;
    // RESPONSE DATA FORMAT 2.
    data[3] = 0x02;
    // ADDITIONAL LENGTH counts the bytes after byte 4.
    data[4] = (INQUIRY_LEN - 5) as u8;
    data[8..16].copy_from_slice(vendor);
    data[16..32].copy_from_slice(product);
    data[32..36].copy_from_slice(revision);
    data
}

/// READ CAPACITY (10) data: the last addressable LBA and the block length,
/// big endian. Capacities past 32 bits report `0xFFFF_FFFF`.
pub fn read_capacity_10(total_blocks: u64, block_size: u32) -> [u8; READ_CAPACITY_10_LEN] {
    let last_lba = u32::try_from(total_blocks.saturating_sub(1)).unwrap_or(u32::MAX);
    let mut data = [0u8; READ_CAPACITY_10_LEN];
    data[0..4].copy_from_slice(&last_lba.to_be_bytes());
    data[4..8].copy_from_slice(&block_size.to_be_bytes());
    data
}
