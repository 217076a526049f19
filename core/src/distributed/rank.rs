use super::{check_world_size, lock};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// Hands out per-round slot indices without pre-agreed worker identities.
///
/// The first call for a key returns 0; every later call returns the previous
/// value plus one, modulo the world size. A rank is therefore an *arrival
/// order* for one round, not a device ordinal: exactly `world_size` calls must
/// land in each round for the slots to line up.
#[derive(Debug, Default)]
pub struct RankAssigner {
    counters: Mutex<HashMap<String, usize>>,
}

impl RankAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next rank in `[0, world_size)` for `key`.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::InvalidWorldSize` if `world_size` is 0.
    pub fn assign(&self, key: &str, world_size: usize) -> Result<usize> {
        check_world_size(world_size)?;
        let mut counters = lock(&self.counters);
        let rank = match counters.get_mut(key) {
            Some(prev) => {
                *prev = if *prev + 1 >= world_size { 0 } else { *prev + 1 };
                *prev
            }
            None => {
                counters.insert(key.to_string(), 0);
                0
            }
        };
        trace!(key, rank, world_size, "assigned rank");
        Ok(rank)
    }

    /// Number of keys with a live counter.
    pub fn len(&self) -> usize {
        lock(&self.counters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every counter.
    pub fn clear(&self) {
        lock(&self.counters).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_assign_cycles() {
        let ranks = RankAssigner::new();
        let got: Vec<usize> = (0..7).map(|_| ranks.assign("k", 3).unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_assign_single_participant() {
        let ranks = RankAssigner::new();
        for _ in 0..3 {
            assert_eq!(ranks.assign("solo", 1).unwrap(), 0);
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let ranks = RankAssigner::new();
        assert_eq!(ranks.assign("a", 2).unwrap(), 0);
        assert_eq!(ranks.assign("a", 2).unwrap(), 1);
        assert_eq!(ranks.assign("b", 2).unwrap(), 0);
        assert_eq!(ranks.len(), 2);

        ranks.clear();
        assert!(ranks.is_empty());
        assert_eq!(ranks.assign("a", 2).unwrap(), 0);
    }

    #[test]
    fn test_zero_world_size() {
        let ranks = RankAssigner::new();
        assert!(ranks.assign("k", 0).is_err());
    }

    #[test]
    fn test_concurrent_round_gets_distinct_ranks() {
        let world_size = 8;
        let ranks = Arc::new(RankAssigner::new());
        let handles: Vec<_> = (0..world_size)
            .map(|_| {
                let ranks = Arc::clone(&ranks);
                thread::spawn(move || ranks.assign("round", world_size).unwrap())
            })
            .collect();

        let got: HashSet<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got, (0..world_size).collect());
    }
}
