//! In-memory register file.
//!
//! Each field holds a latched value. Reads can be scripted per register so a
//! test can model hardware that changes a bit after a few polls, and every
//! write is appended to an ordered log for sequencing assertions.

use std::collections::{HashMap, VecDeque};

use super::{DeviceRegisters, Register};

#[derive(Debug, Default, Clone)]
pub struct FakeRegisters {
    values: HashMap<Register, u32>,
    scripted: HashMap<Register, VecDeque<u32>>,
    log: Vec<(Register, u32)>,
    reads: HashMap<Register, usize>,
}

impl FakeRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latched value without logging a write.
    pub fn set(&mut self, reg: Register, value: u32) -> &mut Self {
        self.values.insert(reg, value);
        self
    }

    pub fn get(&self, reg: Register) -> u32 {
        self.values.get(&reg).copied().unwrap_or(0)
    }

    /// Queues values returned by the next reads of `reg`, in order. Once the
    /// script is exhausted reads fall back to the latched value.
    pub fn script<I: IntoIterator<Item = u32>>(&mut self, reg: Register, values: I) -> &mut Self {
        self.scripted.entry(reg).or_default().extend(values);
        self
    }

    pub fn log(&self) -> &[(Register, u32)] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Values written to `reg`, oldest first.
    pub fn writes_to(&self, reg: Register) -> Vec<u32> {
        self.log
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Low bytes written to a byte-wide register such as the endpoint FIFO.
    pub fn bytes_written(&self, reg: Register) -> Vec<u8> {
        self.writes_to(reg).into_iter().map(|v| v as u8).collect()
    }

    pub fn read_count(&self, reg: Register) -> usize {
        self.reads.get(&reg).copied().unwrap_or(0)
    }
}

impl DeviceRegisters for FakeRegisters {
    fn read(&mut self, reg: Register) -> u32 {
        *self.reads.entry(reg).or_default() += 1;
        if let Some(next) = self.scripted.get_mut(&reg).and_then(VecDeque::pop_front) {
            return next;
        }
        self.get(reg)
    }

    fn write(&mut self, reg: Register, value: u32) {
        self.log.push((reg, value));
        self.values.insert(reg, value);
    }
}
