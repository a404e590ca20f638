//! External synchronization channel
//!
//! Approval-worthy request trees leave the service as encoded
//! [`ChangeRequestDto`] frames and decisions come back as encoded
//! [`DecisionDescription`] frames. The channel trait hides the transport;
//! the in-memory implementation is both the test double and the reference
//! for what a real broker-backed channel must do with the bytes.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::dto::{ChangeRequestDto, DecisionDescription};

pub trait SyncChannel: Send + Sync {
    /// Hand a freshly created request tree to the external side.
    fn export_request(&self, request: &ChangeRequestDto) -> anyhow::Result<()>;

    /// Drain the decisions the external side has sent back since the last
    /// cycle.
    fn import_decisions(&self) -> anyhow::Result<Vec<DecisionDescription>>;
}

/// Channel that goes nowhere. Exports vanish, imports are always empty.
#[derive(Default)]
pub struct NullSyncChannel;

impl SyncChannel for NullSyncChannel {
    fn export_request(&self, _request: &ChangeRequestDto) -> anyhow::Result<()> {
        Ok(())
    }
    fn import_decisions(&self) -> anyhow::Result<Vec<DecisionDescription>> {
        Ok(Vec::new())
    }
}

/// In-memory channel moving encoded frames, used by the tests.
#[derive(Default)]
pub struct MemorySyncChannel {
    exported: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
}

impl MemorySyncChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode everything exported so far.
    pub fn exported_requests(&self) -> anyhow::Result<Vec<ChangeRequestDto>> {
        self.exported
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| Ok(minicbor::decode(bytes)?))
            .collect()
    }

    /// Queue a decision for the next import cycle.
    pub fn queue_decision(&self, decision: &DecisionDescription) -> anyhow::Result<()> {
        let bytes = minicbor::to_vec(decision)?;
        self.inbound.lock().unwrap().push_back(bytes);
        Ok(())
    }
}

impl SyncChannel for MemorySyncChannel {
    fn export_request(&self, request: &ChangeRequestDto) -> anyhow::Result<()> {
        let bytes = minicbor::to_vec(request)?;
        self.exported.lock().unwrap().push(bytes);
        Ok(())
    }

    fn import_decisions(&self) -> anyhow::Result<Vec<DecisionDescription>> {
        let mut inbound = self.inbound.lock().unwrap();
        inbound
            .drain(..)
            .map(|bytes| Ok(minicbor::decode(&bytes)?))
            .collect()
    }
}
