//! # Cross-Worker Synchronization
//!
//! Synchronized batch normalization needs statistics that are identical on every
//! worker and computed over the union of all local batches. This module is the
//! in-process engine that makes that happen without a coordinator thread.
//!
//! ## 🧩 Building Blocks
//!
//! *   [`RankAssigner`](rank::RankAssigner): hands each arriving worker a slot index for the round.
//! *   [`RendezvousBuffer`](rendezvous::RendezvousBuffer): per-worker staging slots plus one
//!     combined result, reduced lazily by whichever worker polls first after the last arrival.
//! *   [`Barrier`](barrier::Barrier): a reusable N-party rendezvous point.
//! *   [`Registry`](registry::Registry): lazily created, key-shared singletons.
//! *   [`SyncContext`](context::SyncContext): owns all of the above for one training session.
//!
//! ## 🔄 One Round
//!
//! ```text
//! worker k:  local stats ──publish(rank_k)──┐
//!                                           ├── barrier.wait() ── retrieve(rank_k) ── combined stats
//! worker j:  local stats ──publish(rank_j)──┘
//! ```
//!
//! Forward and backward use independent groups (the layer key suffixed with
//! [`Phase::tag`]) so the two directions never contend for the same barrier or
//! rank counter.
//!
//! ## 🔌 Backends
//!
//! The layer talks to a [`CollectiveBackend`](backend::CollectiveBackend). The
//! [`RendezvousBackend`](context::RendezvousBackend) drives the engine above; the
//! [`RingBackend`](cpu_backend::RingBackend) is a channel-based ring all-reduce
//! for workers with fixed ranks.

pub mod backend;
pub mod barrier;
pub mod context;
pub mod cpu_backend;
pub mod rank;
pub mod registry;
pub mod rendezvous;

pub use backend::CollectiveBackend;
pub use barrier::{Barrier, BarrierWaitResult};
pub use context::{RendezvousBackend, SyncContext};
pub use cpu_backend::RingBackend;
pub use rank::RankAssigner;
pub use registry::Registry;
pub use rendezvous::{Reduction, RendezvousBuffer};

use crate::error::{Result, SyncBnError};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Direction of a synchronization round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Mean and `E[x²]`, averaged over workers.
    Forward,
    /// Gradient sum and gradient/centered-input cross term, summed over workers.
    Backward,
}

impl Phase {
    /// Suffix appended to the layer key for barrier and rank-counter groups.
    pub const fn tag(self) -> &'static str {
        match self {
            Phase::Forward => "f",
            Phase::Backward => "b",
        }
    }

    /// How staged vectors are combined in this phase.
    pub const fn reduction(self) -> Reduction {
        match self {
            Phase::Forward => Reduction::Mean,
            Phase::Backward => Reduction::Sum,
        }
    }
}

/// Key of the barrier/rank group for one layer and direction.
pub fn phase_key(key: &str, phase: Phase) -> String {
    format!("{}{}", key, phase.tag())
}

pub(crate) fn check_world_size(world_size: usize) -> Result<()> {
    if world_size == 0 {
        return Err(SyncBnError::InvalidWorldSize(world_size));
    }
    Ok(())
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this module leaves its state consistent before it
/// can panic, so a poisoned lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_keys_are_distinct() {
        assert_eq!(phase_key("bn1_", Phase::Forward), "bn1_f");
        assert_eq!(phase_key("bn1_", Phase::Backward), "bn1_b");
        assert_ne!(
            phase_key("layer", Phase::Forward),
            phase_key("layer", Phase::Backward)
        );
    }

    #[test]
    fn test_phase_reduction() {
        assert_eq!(Phase::Forward.reduction(), Reduction::Mean);
        assert_eq!(Phase::Backward.reduction(), Reduction::Sum);
    }

    #[test]
    fn test_check_world_size() {
        assert!(check_world_size(1).is_ok());
        assert!(matches!(
            check_world_size(0),
            Err(SyncBnError::InvalidWorldSize(0))
        ));
    }
}
