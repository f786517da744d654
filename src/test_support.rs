//! Shared fixtures for unit tests.

use std::collections::HashMap;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::control::WorkTable;
use crate::dispatch::{BankedCall, Dispatch};
use crate::regs::FakeRegisters;

/// Routine kinds, for scripting answers independent of call arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recorded {
    PowerCheck,
    ParseDescriptor,
    DmaStatusCheck,
    SecondaryPoll,
    QueueTrigger,
    QueueInit,
    InterruptService,
}

impl From<BankedCall> for Recorded {
    fn from(call: BankedCall) -> Self {
        match call {
            BankedCall::PowerCheck { .. } => Recorded::PowerCheck,
            BankedCall::ParseDescriptor { .. } => Recorded::ParseDescriptor,
            BankedCall::DmaStatusCheck { .. } => Recorded::DmaStatusCheck,
            BankedCall::SecondaryPoll => Recorded::SecondaryPoll,
            BankedCall::QueueTrigger { .. } => Recorded::QueueTrigger,
            BankedCall::QueueInit { .. } => Recorded::QueueInit,
            BankedCall::InterruptService => Recorded::InterruptService,
        }
    }
}

/// Records every call and answers from a per-kind table, zero by default.
#[derive(Debug, Default)]
pub struct RecordingDispatch {
    pub calls: Vec<BankedCall>,
    answers: HashMap<Recorded, u8>,
}

impl RecordingDispatch {
    pub fn answer(&mut self, kind: Recorded, value: u8) {
        self.answers.insert(kind, value);
    }
}

impl Dispatch for RecordingDispatch {
    fn call(&mut self, call: BankedCall, _work: &mut WorkTable) -> u8 {
        self.calls.push(call);
        self.answers
            .get(&Recorded::from(call))
            .copied()
            .unwrap_or(0)
    }
}

pub type TestBridge = Bridge<FakeRegisters, RecordingDispatch>;

pub fn bridge() -> TestBridge {
    Bridge::new(
        FakeRegisters::new(),
        RecordingDispatch::default(),
        BridgeConfig::default(),
    )
}
