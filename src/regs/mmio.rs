//! Memory-mapped binding of [`DeviceRegisters`].
//!
//! Addresses are a porting concern: the porter supplies a [`RegisterMap`]
//! giving the byte offset of each field from the register window base.

use std::collections::HashMap;
use std::ptr::NonNull;

use tracing::trace;

use super::{DeviceRegisters, Register};

/// Byte offsets of register fields within the register window.
#[derive(Debug, Default, Clone)]
pub struct RegisterMap {
    offsets: HashMap<Register, usize>,
    len: usize,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `reg` to `offset`. Offsets must be 4-byte aligned; misaligned
    /// entries are ignored.
    pub fn with(mut self, reg: Register, offset: usize) -> Self {
        if offset % 4 == 0 {
            self.offsets.insert(reg, offset);
            self.len = self.len.max(offset + 4);
        }
        self
    }

    pub fn offset(&self, reg: Register) -> Option<usize> {
        self.offsets.get(&reg).copied()
    }

    /// Size of the window the map spans, in bytes.
    pub fn window_len(&self) -> usize {
        self.len
    }
}

/// 32-bit volatile access to a register window.
#[derive(Debug)]
pub struct MmioRegisters {
    base: NonNull<u8>,
    map: RegisterMap,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must point to a 4-byte aligned window of at least
    /// `map.window_len()` bytes that stays valid, and is not otherwise
    /// aliased, for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, map: RegisterMap) -> Option<Self> {
        let base = NonNull::new(base)?;
        Some(Self { base, map })
    }

    fn field(&self, reg: Register) -> Option<*mut u32> {
        let offset = self.map.offset(reg)?;
        // SAFETY: `new` requires the window to cover every mapped offset.
        Some(unsafe { self.base.as_ptr().add(offset) }.cast::<u32>())
    }
}

impl DeviceRegisters for MmioRegisters {
    fn read(&mut self, reg: Register) -> u32 {
        match self.field(reg) {
            // SAFETY: aligned and in bounds per the contract of `new`.
            Some(ptr) => unsafe { ptr.read_volatile() },
            None => {
                trace!(?reg, "read of unmapped register");
                0
            }
        }
    }

    fn write(&mut self, reg: Register, value: u32) {
        match self.field(reg) {
            // SAFETY: aligned and in bounds per the contract of `new`.
            Some(ptr) => unsafe { ptr.write_volatile(value) },
            None => trace!(?reg, value, "write to unmapped register dropped"),
        }
    }
}
