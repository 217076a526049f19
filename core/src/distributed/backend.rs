use super::Phase;
use crate::error::Result;

/// Abstraction for the statistics exchange between workers.
///
/// Every call is a collective: all `world_size` workers of the group must make
/// the matching call for the same `key` and `phase`, or the callers block.
///
/// Two per-channel vectors travel together. In the forward phase they are the
/// local `E[x]` and `E[x²]` and come back averaged over workers; in the
/// backward phase they are the local gradient sum and cross-term sum and come
/// back summed.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the total number of participating workers.
    fn world_size(&self) -> usize;

    /// Combines `(first, second)` across all workers of the group.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::ShapeMismatch` if the two vectors differ in length
    /// or do not match the length the group was first used with.
    fn reduce_stats(
        &self,
        key: &str,
        phase: Phase,
        first: &[f32],
        second: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>)>;
}
