//! Tunables for the bridge core.

use serde::Deserialize;

use crate::error::BridgeError;
use crate::poll::WaitPolicy;

/// Bridge configuration. Every field has a default, so a configuration file
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Polls of a hardware-ready bit before a bounded wait gives up.
    pub poll_attempts: u32,
    /// Interrupt-service passes allowed while queue sync waits for the link
    /// to drop its pending-interrupt bit.
    pub isr_retry_limit: u32,
    /// Retries (timeouts or overflows) tolerated before a slot is failed.
    pub max_retries: u8,
    /// Transfer accumulator value treated as an overflow.
    pub overflow_threshold: u32,
    /// Logical block size in bytes.
    pub block_size: u32,
    /// Number of logical blocks in namespace 1.
    pub namespace_blocks: u64,
    /// Largest NVMe command, in blocks; longer transfers are chained.
    pub max_blocks_per_command: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 10_000,
            isr_retry_limit: 64,
            max_retries: 3,
            overflow_threshold: 0x0100_0000,
            block_size: 512,
            namespace_blocks: 0x0010_0000,
            max_blocks_per_command: 256,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::Bounded(self.poll_attempts)
    }
}
