use super::{check_world_size, lock};
use crate::error::{Result, SyncBnError};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// How the staged slot vectors are folded into the combined result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Element-wise sum divided by the world size.
    Mean,
    /// Plain element-wise sum.
    Sum,
}

#[derive(Debug)]
struct RendezvousState {
    slots: Vec<Vec<f32>>,
    ready: Vec<bool>,
    combined: Vec<f32>,
    combined_ready: bool,
    len: Option<usize>,
    rounds: u64,
}

impl RendezvousState {
    /// True while a combined result is still being handed out and `rank` has
    /// already taken its copy, so a signal from `rank` belongs to the next round.
    fn draining_for(&self, rank: usize) -> bool {
        self.combined_ready && !self.ready[rank]
    }

    fn write_slot(&mut self, rank: usize, value: &[f32]) -> Result<()> {
        match self.len {
            Some(len) if len != value.len() => {
                return Err(SyncBnError::ShapeMismatch {
                    expected: vec![len],
                    got: vec![value.len()],
                });
            }
            Some(_) => {}
            None => self.len = Some(value.len()),
        }
        let slot = &mut self.slots[rank];
        slot.clear();
        slot.extend_from_slice(value);
        Ok(())
    }

    fn set_ready(&mut self, rank: usize) -> bool {
        if self.ready[rank] {
            return false;
        }
        self.ready[rank] = true;
        true
    }

    /// Reduces all slots once every rank is ready; afterwards returns the cache.
    fn try_combine(&mut self, reduction: Reduction) -> bool {
        if self.combined_ready {
            return true;
        }
        if !self.ready.iter().all(|&r| r) {
            return false;
        }

        let len = self.len.unwrap_or(0);
        self.combined.clear();
        self.combined.resize(len, 0.0);
        for slot in &self.slots {
            for (acc, &v) in self.combined.iter_mut().zip(slot) {
                *acc += v;
            }
        }
        if reduction == Reduction::Mean {
            let n = self.slots.len() as f32;
            self.combined.iter_mut().for_each(|v| *v /= n);
        }

        self.combined_ready = true;
        self.rounds += 1;
        debug!(round = self.rounds, len, ?reduction, "combined rendezvous slots");
        true
    }
}

/// Staging area where `world_size` workers exchange one vector quantity.
///
/// A round moves through `EMPTY → (all ranks staged and ready) → COMBINED →
/// (all ranks retrieved) → EMPTY`. The reduction runs lazily on whichever
/// worker polls first after the last rank became ready, so no coordinator
/// thread is involved. The combined result is computed at most once per round
/// and is only invalidated after every rank has retrieved it.
///
/// Staging is exclusive per rank: only the worker holding `rank` in this round
/// writes that slot. The vector length is fixed by the first `stage` call.
#[derive(Debug)]
pub struct RendezvousBuffer {
    state: Mutex<RendezvousState>,
    cvar: Condvar,
    world_size: usize,
    reduction: Reduction,
}

impl RendezvousBuffer {
    /// Creates an empty buffer for `world_size` participants.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::InvalidWorldSize` if `world_size` is 0.
    pub fn new(world_size: usize, reduction: Reduction) -> Result<Self> {
        check_world_size(world_size)?;
        Ok(Self {
            state: Mutex::new(RendezvousState {
                slots: vec![Vec::new(); world_size],
                ready: vec![false; world_size],
                combined: Vec::new(),
                combined_ready: false,
                len: None,
                rounds: 0,
            }),
            cvar: Condvar::new(),
            world_size,
            reduction,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Vector length fixed by the first `stage`, if any.
    pub fn len(&self) -> Option<usize> {
        lock(&self.state).len
    }

    /// Number of rounds combined so far.
    pub fn round(&self) -> u64 {
        lock(&self.state).rounds
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size {
            return Err(SyncBnError::RankOutOfRange {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    /// Waits until no combined result is outstanding.
    ///
    /// Ranks are reassigned every round, so slot `rank` of the next round may
    /// still belong to a slow worker that has not retrieved the current one.
    /// Nothing may be written until the whole round has drained.
    fn wait_for_drain(&self) -> MutexGuard<'_, RendezvousState> {
        self.cvar
            .wait_while(lock(&self.state), |s| s.combined_ready)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes this worker's local contribution into slot `rank`.
    ///
    /// Re-staging before the round is combined overwrites the slot. While a
    /// combined result is still being handed out, the call blocks until the
    /// last rank has retrieved it.
    ///
    /// The buffer only sees ranks, not callers: a worker that stages again
    /// after the round combined but before its own `retrieve` waits on itself
    /// and never returns. Always `retrieve` before the next `stage`/`publish`.
    pub fn stage(&self, rank: usize, value: &[f32]) -> Result<()> {
        self.check_rank(rank)?;
        let mut state = self.wait_for_drain();
        state.write_slot(rank, value)
    }

    /// Flags slot `rank` as holding fresh data.
    ///
    /// Returns `false` without side effects if the flag was already set.
    pub fn mark_ready(&self, rank: usize) -> Result<bool> {
        self.check_rank(rank)?;
        let mut state = self
            .cvar
            .wait_while(lock(&self.state), |s| s.draining_for(rank))
            .unwrap_or_else(PoisonError::into_inner);
        let transitioned = state.set_ready(rank);
        if transitioned {
            self.cvar.notify_all();
        } else {
            warn!(rank, "redundant ready signal ignored");
        }
        Ok(transitioned)
    }

    /// `stage` followed by `mark_ready` under one lock acquisition.
    ///
    /// Blocks like [`stage`](Self::stage), with the same retrieve-first rule.
    pub fn publish(&self, rank: usize, value: &[f32]) -> Result<bool> {
        self.check_rank(rank)?;
        let mut state = self.wait_for_drain();
        state.write_slot(rank, value)?;
        let transitioned = state.set_ready(rank);
        if transitioned {
            self.cvar.notify_all();
        } else {
            warn!(rank, "redundant ready signal ignored");
        }
        Ok(transitioned)
    }

    /// Returns whether the combined result for the current round is available,
    /// computing it on the first call after every rank became ready.
    pub fn is_combined(&self) -> bool {
        lock(&self.state).try_combine(self.reduction)
    }

    /// Blocks until the round is combined, then hands out the result to `rank`.
    ///
    /// Clears this rank's ready flag. The last rank to retrieve resets the
    /// buffer for the next round.
    pub fn retrieve(&self, rank: usize) -> Result<Vec<f32>> {
        self.check_rank(rank)?;
        let reduction = self.reduction;
        let mut state = self
            .cvar
            .wait_while(lock(&self.state), |s| !s.try_combine(reduction))
            .unwrap_or_else(PoisonError::into_inner);

        state.ready[rank] = false;
        let value = state.combined.clone();
        if state.ready.iter().all(|&r| !r) {
            state.combined_ready = false;
            self.cvar.notify_all();
        }
        Ok(value)
    }
}
