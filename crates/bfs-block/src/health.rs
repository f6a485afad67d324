//! Volume-wide health state shared by the cache, journal, allocator, and
//! trees.
//!
//! Corruption or a failed journal write escalates the volume; once escalated
//! it never returns to healthy for the lifetime of the mount.

use bfs_error::{BfsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    /// Mounted read-only on request.
    ReadOnlyMount,
    /// Escalated after an unrecoverable error; writes refused.
    ReadOnlyEscalated,
}

impl HealthState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Healthy,
            1 => Self::ReadOnlyMount,
            _ => Self::ReadOnlyEscalated,
        }
    }
}

#[derive(Debug)]
pub struct VolumeHealth {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
}

impl Default for VolumeHealth {
    fn default() -> Self {
        Self::new(HealthState::Healthy)
    }
}

impl VolumeHealth {
    #[must_use]
    pub fn new(initial: HealthState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            reason: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.state() == HealthState::Healthy
    }

    /// `Err(ReadOnly)` unless the volume accepts writes.
    pub fn check_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(BfsError::ReadOnly)
        }
    }

    /// Escalate to read-only. The first reason wins.
    pub fn escalate(&self, reason: &str) {
        let previous = self
            .state
            .swap(HealthState::ReadOnlyEscalated as u8, Ordering::AcqRel);
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.to_owned());
        }
        drop(slot);
        if HealthState::from_u8(previous) != HealthState::ReadOnlyEscalated {
            error!(target: "bfs::health", reason, "volume_escalated_read_only");
        }
    }

    /// Escalate if `err` is corruption-class, then hand it back.
    #[must_use]
    pub fn note(&self, err: BfsError) -> BfsError {
        if err.is_corruption() {
            self.escalate(&err.to_string());
        }
        err
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
