use super::{check_world_size, lock};
use crate::error::Result;
use std::sync::{Condvar, Mutex, PoisonError};
use tracing::trace;

#[derive(Debug)]
struct BarrierState {
    remaining: usize,
    generation: u64,
}

/// A reusable N-party rendezvous point.
///
/// Each call to [`wait`](Barrier::wait) blocks until `world_size` calls have
/// been made since the last release. The last arrival releases everyone and
/// re-arms the barrier for the next round.
///
/// Waiters compare a generation counter rather than the arrival count, so a
/// fast worker that re-enters the next round before a slow one has woken up
/// cannot trap it.
///
/// A round that never gets `world_size` arrivals blocks forever; there is no
/// timeout or cancellation.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    world_size: usize,
}

/// Returned by [`Barrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult(bool);

impl BarrierWaitResult {
    /// True for exactly one caller per round: the arrival that released it.
    pub fn is_leader(&self) -> bool {
        self.0
    }
}

impl Barrier {
    /// Creates a barrier for `world_size` participants.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::InvalidWorldSize` if `world_size` is 0.
    pub fn new(world_size: usize) -> Result<Self> {
        check_world_size(world_size)?;
        Ok(Self {
            state: Mutex::new(BarrierState {
                remaining: world_size,
                generation: 0,
            }),
            cvar: Condvar::new(),
            world_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of callers currently blocked in the open round.
    pub fn waiting(&self) -> usize {
        self.world_size - lock(&self.state).remaining
    }

    /// Number of completed rounds.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Blocks until all `world_size` participants of this round have arrived.
    pub fn wait(&self) -> BarrierWaitResult {
        let mut state = lock(&self.state);
        state.remaining -= 1;

        if state.remaining == 0 {
            state.remaining = self.world_size;
            state.generation = state.generation.wrapping_add(1);
            trace!(
                generation = state.generation,
                world_size = self.world_size,
                "barrier released"
            );
            self.cvar.notify_all();
            return BarrierWaitResult(true);
        }

        let generation = state.generation;
        let _released = self
            .cvar
            .wait_while(state, |s| s.generation == generation)
            .unwrap_or_else(PoisonError::into_inner);
        BarrierWaitResult(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_participant_never_blocks() {
        let barrier = Barrier::new(1).unwrap();
        for round in 1..=3 {
            assert!(barrier.wait().is_leader());
            assert_eq!(barrier.generation(), round);
        }
    }

    #[test]
    fn test_zero_participants_rejected() {
        assert!(Barrier::new(0).is_err());
    }

    #[test]
    fn test_exactly_one_leader_per_round() {
        let world_size = 4;
        let rounds = 25;
        let barrier = Arc::new(Barrier::new(world_size).unwrap());
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..world_size)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    for _ in 0..rounds {
                        if barrier.wait().is_leader() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), rounds);
        assert_eq!(barrier.generation(), rounds as u64);
        assert_eq!(barrier.waiting(), 0);
    }

    #[test]
    fn test_partial_round_stays_blocked() {
        let barrier = Arc::new(Barrier::new(3).unwrap());
        let passed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let passed = Arc::clone(&passed);
                thread::spawn(move || {
                    barrier.wait();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while barrier.waiting() < 2 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        assert!(barrier.wait().is_leader());
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 2);
    }
}
