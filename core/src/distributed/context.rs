use super::backend::CollectiveBackend;
use super::barrier::Barrier;
use super::rank::RankAssigner;
use super::registry::Registry;
use super::rendezvous::RendezvousBuffer;
use super::{Phase, check_world_size, phase_key};
use crate::error::{Result, SyncBnError};
use std::sync::Arc;
use tracing::trace;

/// Shared state of one training session.
///
/// Owns the rank counters, barriers and the four statistic buffers (mean and
/// `E[x²]` for the forward phase, gradient sum and cross term for the backward
/// phase). Workers share it through an `Arc`; dropping the last handle, or
/// calling [`clear`](SyncContext::clear) between sessions, releases every entry.
///
/// Statistic buffers are keyed by the plain layer key. Barriers and rank
/// counters are keyed by the layer key plus the [`Phase`] tag, so forward and
/// backward rounds of the same layer never share a rendezvous point.
#[derive(Debug)]
pub struct SyncContext {
    ranks: RankAssigner,
    barriers: Registry<Barrier>,
    means: Registry<RendezvousBuffer>,
    second_moments: Registry<RendezvousBuffer>,
    grad_sums: Registry<RendezvousBuffer>,
    cross_terms: Registry<RendezvousBuffer>,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncContext {
    pub fn new() -> Self {
        Self {
            ranks: RankAssigner::new(),
            barriers: Registry::new("barrier"),
            means: Registry::new("mean"),
            second_moments: Registry::new("second_moment"),
            grad_sums: Registry::new("grad_sum"),
            cross_terms: Registry::new("cross_term"),
        }
    }

    /// Next arrival rank for the `(key, phase)` group.
    pub fn assign_rank(&self, key: &str, phase: Phase, world_size: usize) -> Result<usize> {
        self.ranks.assign(&phase_key(key, phase), world_size)
    }

    /// The barrier of the `(key, phase)` group, created on first use.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::InvalidConfig` if the group already exists with a
    /// different participant count.
    pub fn barrier(&self, key: &str, phase: Phase, world_size: usize) -> Result<Arc<Barrier>> {
        check_world_size(world_size)?;
        let group = phase_key(key, phase);
        let barrier = self
            .barriers
            .get_or_try_create(&group, || Barrier::new(world_size))?;
        if barrier.world_size() != world_size {
            return Err(SyncBnError::InvalidConfig(format!(
                "group '{}' was created for {} workers, got {}",
                group,
                barrier.world_size(),
                world_size
            )));
        }
        Ok(barrier)
    }

    /// The two statistic buffers used by `phase` for layer `key`.
    pub fn buffers(
        &self,
        key: &str,
        phase: Phase,
        world_size: usize,
    ) -> Result<(Arc<RendezvousBuffer>, Arc<RendezvousBuffer>)> {
        check_world_size(world_size)?;
        let (first, second) = match phase {
            Phase::Forward => (&self.means, &self.second_moments),
            Phase::Backward => (&self.grad_sums, &self.cross_terms),
        };
        let reduction = phase.reduction();
        let first = first.get_or_try_create(key, || RendezvousBuffer::new(world_size, reduction))?;
        let second =
            second.get_or_try_create(key, || RendezvousBuffer::new(world_size, reduction))?;

        for buf in [&first, &second] {
            if buf.world_size() != world_size {
                return Err(SyncBnError::InvalidConfig(format!(
                    "buffers for '{}' were created for {} workers, got {}",
                    key,
                    buf.world_size(),
                    world_size
                )));
            }
        }
        Ok((first, second))
    }

    /// Runs one full round of the protocol for this worker.
    ///
    /// 1. look up the group's barrier and buffers,
    /// 2. take this round's rank,
    /// 3. publish both local vectors into that rank's slots,
    /// 4. wait on the barrier until every worker has published,
    /// 5. retrieve both combined vectors.
    ///
    /// Shape errors are reported before a rank is taken, so a rejected call
    /// leaves the group untouched.
    pub fn all_reduce_pair(
        &self,
        key: &str,
        phase: Phase,
        world_size: usize,
        first: &[f32],
        second: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        if first.len() != second.len() {
            return Err(SyncBnError::ShapeMismatch {
                expected: vec![first.len()],
                got: vec![second.len()],
            });
        }

        let barrier = self.barrier(key, phase, world_size)?;
        let (first_buf, second_buf) = self.buffers(key, phase, world_size)?;
        if let Some(len) = first_buf.len().filter(|&len| len != first.len()) {
            return Err(SyncBnError::ShapeMismatch {
                expected: vec![len],
                got: vec![first.len()],
            });
        }

        let rank = self.assign_rank(key, phase, world_size)?;
        first_buf.publish(rank, first)?;
        second_buf.publish(rank, second)?;
        trace!(key, ?phase, rank, "published local statistics");

        barrier.wait();

        let combined_first = first_buf.retrieve(rank)?;
        let combined_second = second_buf.retrieve(rank)?;
        trace!(key, ?phase, rank, "retrieved combined statistics");
        Ok((combined_first, combined_second))
    }

    /// Rounds combined so far for `(key, phase)`, 0 if the group never ran.
    ///
    /// Never creates a group.
    pub fn completed_rounds(&self, key: &str, phase: Phase) -> u64 {
        let buffer = match phase {
            Phase::Forward => self.means.get(key),
            Phase::Backward => self.grad_sums.get(key),
        };
        buffer.map_or(0, |buf| buf.round())
    }

    /// Number of live `(key, phase)` groups.
    pub fn group_count(&self) -> usize {
        self.barriers.len()
    }

    /// Releases every barrier, buffer and rank counter.
    ///
    /// Must only be called while no worker is inside a round.
    pub fn clear(&self) {
        self.ranks.clear();
        self.barriers.clear();
        self.means.clear();
        self.second_moments.clear();
        self.grad_sums.clear();
        self.cross_terms.clear();
    }
}

/// [`CollectiveBackend`] driven by a shared [`SyncContext`].
///
/// Cheap to clone: hand one clone to each worker thread.
#[derive(Debug, Clone)]
pub struct RendezvousBackend {
    context: Arc<SyncContext>,
    world_size: usize,
}

impl RendezvousBackend {
    pub fn new(context: Arc<SyncContext>, world_size: usize) -> Result<Self> {
        check_world_size(world_size)?;
        Ok(Self {
            context,
            world_size,
        })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }
}

impl CollectiveBackend for RendezvousBackend {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn reduce_stats(
        &self,
        key: &str,
        phase: Phase,
        first: &[f32],
        second: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        self.context
            .all_reduce_pair(key, phase, self.world_size, first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::Reduction;
    use std::thread;

    #[test]
    fn test_groups_are_created_lazily_per_phase() {
        let ctx = SyncContext::new();
        assert_eq!(ctx.group_count(), 0);

        let f = ctx.barrier("bn", Phase::Forward, 2).unwrap();
        let f_again = ctx.barrier("bn", Phase::Forward, 2).unwrap();
        let b = ctx.barrier("bn", Phase::Backward, 2).unwrap();
        assert!(Arc::ptr_eq(&f, &f_again));
        assert!(!Arc::ptr_eq(&f, &b));
        assert_eq!(ctx.group_count(), 2);

        ctx.clear();
        assert_eq!(ctx.group_count(), 0);
    }

    #[test]
    fn test_buffer_reduction_follows_phase() {
        let ctx = SyncContext::new();
        let (mean, var) = ctx.buffers("bn", Phase::Forward, 2).unwrap();
        let (grad, prod) = ctx.buffers("bn", Phase::Backward, 2).unwrap();
        assert_eq!(mean.reduction(), Reduction::Mean);
        assert_eq!(var.reduction(), Reduction::Mean);
        assert_eq!(grad.reduction(), Reduction::Sum);
        assert_eq!(prod.reduction(), Reduction::Sum);
        assert!(!Arc::ptr_eq(&mean, &var));
    }

    #[test]
    fn test_rank_counters_are_per_phase() {
        let ctx = SyncContext::new();
        assert_eq!(ctx.assign_rank("bn", Phase::Forward, 2).unwrap(), 0);
        assert_eq!(ctx.assign_rank("bn", Phase::Backward, 2).unwrap(), 0);
        assert_eq!(ctx.assign_rank("bn", Phase::Forward, 2).unwrap(), 1);
    }

    #[test]
    fn test_world_size_mismatch_is_reported() {
        let ctx = SyncContext::new();
        ctx.barrier("bn", Phase::Forward, 2).unwrap();
        assert!(matches!(
            ctx.barrier("bn", Phase::Forward, 3),
            Err(SyncBnError::InvalidConfig(_))
        ));
        ctx.buffers("bn", Phase::Forward, 2).unwrap();
        assert!(ctx.buffers("bn", Phase::Forward, 4).is_err());
    }

    #[test]
    fn test_single_worker_round_trip() {
        let ctx = SyncContext::new();
        let (mean, ex2) = ctx
            .all_reduce_pair("solo", Phase::Forward, 1, &[1.0, 2.0], &[1.0, 4.0])
            .unwrap();
        assert_eq!(mean, vec![1.0, 2.0]);
        assert_eq!(ex2, vec![1.0, 4.0]);
    }

    #[test]
    fn test_completed_rounds_is_read_only() {
        let ctx = SyncContext::new();
        assert_eq!(ctx.completed_rounds("solo", Phase::Forward), 0);
        assert_eq!(ctx.group_count(), 0);

        for _ in 0..3 {
            ctx.all_reduce_pair("solo", Phase::Forward, 1, &[1.0], &[1.0])
                .unwrap();
        }
        assert_eq!(ctx.completed_rounds("solo", Phase::Forward), 3);
        assert_eq!(ctx.completed_rounds("solo", Phase::Backward), 0);
        assert_eq!(ctx.group_count(), 1);
    }

    #[test]
    fn test_shape_error_leaves_group_usable() {
        let ctx = SyncContext::new();
        ctx.all_reduce_pair("solo", Phase::Backward, 1, &[1.0], &[2.0])
            .unwrap();

        let err = ctx.all_reduce_pair("solo", Phase::Backward, 1, &[1.0, 2.0], &[2.0, 3.0]);
        assert!(matches!(err, Err(SyncBnError::ShapeMismatch { .. })));
        let err = ctx.all_reduce_pair("solo", Phase::Backward, 1, &[1.0], &[2.0, 3.0]);
        assert!(matches!(err, Err(SyncBnError::ShapeMismatch { .. })));

        let (g, p) = ctx
            .all_reduce_pair("solo", Phase::Backward, 1, &[5.0], &[6.0])
            .unwrap();
        assert_eq!((g, p), (vec![5.0], vec![6.0]));
    }

    #[test]
    fn test_backend_two_workers() {
        let ctx = Arc::new(SyncContext::new());
        let backend = RendezvousBackend::new(Arc::clone(&ctx), 2).unwrap();

        let handles: Vec<_> = [[1.0f32, 2.0, 3.0], [3.0, 4.0, 5.0]]
            .into_iter()
            .map(|local| {
                let backend = backend.clone();
                thread::spawn(move || {
                    backend
                        .reduce_stats("layer", Phase::Forward, &local, &local)
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            let (mean, _) = h.join().unwrap();
            assert_eq!(mean, vec![2.0, 3.0, 4.0]);
        }
        assert!(Arc::ptr_eq(backend.context(), &ctx));
    }
}
