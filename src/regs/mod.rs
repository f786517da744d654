//! Named device register fields the bridge core reads and writes.
//!
//! The core never touches an address directly. Everything goes through
//! [`DeviceRegisters`], so the same logic runs against real memory-mapped
//! hardware ([`mmio::MmioRegisters`]) or an in-memory register file
//! ([`fake::FakeRegisters`]).

pub mod fake;
pub mod mmio;

pub use fake::FakeRegisters;
pub use mmio::{MmioRegisters, RegisterMap};

/// Every register field the core knows about.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    /// Non-zero when the active endpoint reports a pending condition.
    EndpointStatus,
    /// Active endpoint transfer type (see [`crate::usb::UsbMode`]).
    EndpointConfig,
    /// Byte-wide transmit path toward the host (CSWs and locally served data).
    EndpointFifo,
    /// Bit 0 ([`FIFO_READY`]) set when the USB FIFO can accept a DMA burst.
    FifoStatus,
    /// Current USB mode selector.
    UsbMode,
    /// Status byte written when a setup phase completes.
    SetupStatus,
    /// Status byte for the alternate transfer kind.
    AltSetupStatus,
    /// Where the next host read starts (header or payload position).
    BufferPointer,
    /// Buffer length programmed for the next data phase.
    BufferLength,
    /// Event offset consumed by an interface reset.
    InterfaceEvent,
    /// Interface control; writing [`INTERFACE_INIT`] restarts the interface.
    InterfaceControl,
    /// Slot index the DMA engine is programmed for.
    DmaSlot,
    /// Byte count the DMA engine is programmed for.
    DmaLength,
    /// 1 for device-to-host, 0 for host-to-device.
    DmaDirection,
    /// Writing [`DMA_START`] starts the programmed transfer.
    DmaTrigger,
    /// Bit 0 ([`DMA_READY`]) set when the DMA engine accepts a new program.
    TransferStatus,
    /// Hardware byte counter reloaded into the transfer accumulator.
    TransferCount,
    /// Bit 0 ([`LINK_READY`]) gates the completion drain.
    LinkStatus,
    /// Bit 3 ([`LINK_IRQ_PENDING`]) requests interrupt service, bit 7
    /// ([`LINK_LOCKUP`]) marks an interface lockup.
    LinkControl,
    /// Low 6 bits carry the index of the next NVMe completion.
    QueueStatus,
    /// Completion trigger; written with [`ACK_ALL`] to acknowledge.
    QueueTrigger,
    /// Queue index latched for synchronization; written with [`ACK_ALL`].
    QueueIndex,
    /// Submission queue tail doorbell.
    Doorbell,
    /// Byte-wide window into the NVMe submission path.
    SubmissionWindow,
}

pub const FIFO_READY: u32 = 1 << 0;
pub const DMA_READY: u32 = 1 << 0;
pub const LINK_READY: u32 = 1 << 0;
pub const LINK_IRQ_PENDING: u32 = 1 << 3;
pub const LINK_LOCKUP: u32 = 1 << 7;

pub const DMA_START: u32 = 0x01;
pub const INTERFACE_INIT: u32 = 0x01;
pub const ACK_ALL: u32 = 0xFF;

/// Read/write access to the device register fields.
///
/// Reads take `&mut self` because several fields have read side effects on
/// real hardware (queue status pops the completion it reports).
pub trait DeviceRegisters {
    fn read(&mut self, reg: Register) -> u32;
    fn write(&mut self, reg: Register, value: u32);

    /// Read-modify-write. Not atomic with respect to interrupts: callers that
    /// race an interrupt handler must provide their own exclusion.
    fn modify(&mut self, reg: Register, clear: u32, set: u32) {
        let value = self.read(reg);
        self.write(reg, (value & !clear) | set);
    }

    /// Pushes `bytes` through a byte-wide register in order.
    fn write_bytes(&mut self, reg: Register, bytes: &[u8]) {
        for &b in bytes {
            self.write(reg, b as u32);
        }
    }

    fn is_set(&mut self, reg: Register, mask: u32) -> bool {
        self.read(reg) & mask != 0
    }
}
