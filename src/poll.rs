//! Busy-wait on hardware-ready bits.

use std::hint;

use tracing::error;

use crate::error::PollTimeout;
use crate::regs::{DeviceRegisters, Register};

/// How long a busy-wait may spin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Give up after this many polls.
    Bounded(u32),
    /// Spin until the condition holds. Only for branches where the hardware
    /// expects an external reset to break the loop.
    Forever,
}

/// What a wait is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Until {
    Set,
    Clear,
}

/// Polls `reg` until the bits in `mask` are all set (or all clear). Returns
/// the number of polls taken.
pub fn wait_for<R: DeviceRegisters + ?Sized>(
    regs: &mut R,
    reg: Register,
    mask: u32,
    until: Until,
    policy: WaitPolicy,
) -> Result<u32, PollTimeout> {
    let mut attempts = 0u32;
    let mut logged = false;
    loop {
        let value = regs.read(reg);
        attempts = attempts.saturating_add(1);
        let done = match until {
            Until::Set => value & mask == mask,
            Until::Clear => value & mask == 0,
        };
        if done {
            return Ok(attempts);
        }
        match policy {
            WaitPolicy::Bounded(max) if attempts >= max => {
                return Err(PollTimeout {
                    register: reg,
                    attempts,
                });
            }
            WaitPolicy::Bounded(_) => {}
            WaitPolicy::Forever if !logged => {
                error!(?reg, mask, "waiting for external reset");
                logged = true;
            }
            WaitPolicy::Forever => {}
        }
        hint::spin_loop();
    }
}
