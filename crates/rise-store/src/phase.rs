//! Explicit train/sample barrier around the shared cache.

use crate::{SampleStoreError, StoreResult};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const IDLE: u8 = 0;

/// Phase of the fold loop that currently owns the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Sample,
}

impl Phase {
    fn code(self) -> u8 {
        match self {
            Self::Train => 1,
            Self::Sample => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Train),
            2 => Some(Self::Sample),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Sample => f.write_str("sample"),
        }
    }
}

/// Hands out at most one phase guard at a time.
#[derive(Debug, Clone, Default)]
pub struct PhaseGate {
    lock: Arc<Mutex<()>>,
    active: Arc<AtomicU8>,
}

impl PhaseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters `phase`, failing with [`SampleStoreError::PhaseConflict`] while
    /// another guard is alive.
    pub fn try_enter(&self, phase: Phase) -> StoreResult<PhaseGuard> {
        let permit = self.lock.clone().try_lock_owned().map_err(|_| {
            SampleStoreError::PhaseConflict {
                requested: phase,
                active: self.active(),
            }
        })?;
        self.active.store(phase.code(), Ordering::Release);
        tracing::debug!(%phase, "entered phase");
        Ok(PhaseGuard {
            phase,
            active: self.active.clone(),
            _permit: permit,
        })
    }

    pub fn active(&self) -> Option<Phase> {
        Phase::from_code(self.active.load(Ordering::Acquire))
    }

    /// Returns true when `guard` was issued by this gate.
    pub fn issued(&self, guard: &PhaseGuard) -> bool {
        Arc::ptr_eq(&self.active, &guard.active)
    }
}

/// Proof that the holder owns the cache for one phase.
#[derive(Debug)]
pub struct PhaseGuard {
    phase: Phase,
    active: Arc<AtomicU8>,
    _permit: OwnedMutexGuard<()>,
}

impl PhaseGuard {
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.active.store(IDLE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{Phase, PhaseGate};
    use crate::SampleStoreError;

    #[test]
    fn second_phase_conflicts_until_first_guard_drops() {
        let gate = PhaseGate::new();
        let train = gate.try_enter(Phase::Train).expect("train");
        assert_eq!(gate.active(), Some(Phase::Train));

        let error = gate.try_enter(Phase::Sample).expect_err("conflict");
        assert!(matches!(
            error,
            SampleStoreError::PhaseConflict {
                requested: Phase::Sample,
                active: Some(Phase::Train)
            }
        ));

        drop(train);
        assert_eq!(gate.active(), None);
        let sample = gate.try_enter(Phase::Sample).expect("sample");
        assert_eq!(sample.phase(), Phase::Sample);
        assert!(gate.issued(&sample));
        assert!(!PhaseGate::new().issued(&sample));
    }
}
