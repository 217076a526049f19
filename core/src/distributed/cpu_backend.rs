use super::backend::CollectiveBackend;
use super::{Phase, check_world_size};
use crate::error::{Result, SyncBnError};
use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::trace;

/// Channel-based collective backend for workers with fixed ranks.
///
/// Implements **Ring All-Reduce** over `crossbeam` channels: a reduce-scatter
/// pass followed by an all-gather pass, each `world_size - 1` steps long. Each
/// publish is a whole-vector message and each retrieve a receive, so the
/// staging/combination ordering of the rendezvous engine holds without shared
/// mutable state.
///
/// One ring serves one group. The `key` passed to
/// [`reduce_stats`](CollectiveBackend::reduce_stats) is not used for routing,
/// so layers must issue their collectives in the same order on every worker.
#[derive(Debug)]
pub struct RingBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<f32>>, // Receive from rank - 1
    right_tx: Sender<Vec<f32>>,  // Send to rank + 1
}

impl RingBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<f32>>,
        right_tx: Sender<Vec<f32>>,
    ) -> Result<Self> {
        check_world_size(world_size)?;
        if rank >= world_size {
            return Err(SyncBnError::RankOutOfRange { rank, world_size });
        }
        Ok(Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        })
    }

    /// Wires up a complete ring `0 -> 1 -> ... -> world_size - 1 -> 0`.
    ///
    /// Element `i` of the result is the backend for rank `i`.
    pub fn ring(world_size: usize) -> Result<Vec<Self>> {
        check_world_size(world_size)?;
        // Channel i carries messages from rank i to rank i + 1.
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();

        (0..world_size)
            .map(|rank| {
                let left = (rank + world_size - 1) % world_size;
                Self::new(rank, world_size, rxs[left].clone(), txs[rank].clone())
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    fn chunk_bounds(&self, idx: usize, chunk_size: usize, total: usize) -> (usize, usize) {
        let start = (idx * chunk_size).min(total);
        (start, (start + chunk_size).min(total))
    }

    fn exchange(&self, outgoing: Vec<f32>) -> Result<Vec<f32>> {
        self.right_tx
            .send(outgoing)
            .map_err(|_| SyncBnError::PeerDisconnected { rank: self.rank })?;
        self.left_rx
            .recv()
            .map_err(|_| SyncBnError::PeerDisconnected { rank: self.rank })
    }

    /// In-place element-wise sum of `data` across every rank of the ring.
    pub fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        let n = self.world_size;
        let total = data.len();
        let chunk_size = total.div_ceil(n);
        let chunk_of = |offset: usize| (self.rank + n - offset % n) % n;

        // --- Phase 1: Scatter-Reduce ---
        // Step s: send chunk (rank - s), receive and accumulate chunk (rank - s - 1).
        for step in 0..n - 1 {
            let (start, end) = self.chunk_bounds(chunk_of(step), chunk_size, total);
            let received = self.exchange(data[start..end].to_vec())?;

            let (recv_start, recv_end) = self.chunk_bounds(chunk_of(step + 1), chunk_size, total);
            for (acc, v) in data[recv_start..recv_end].iter_mut().zip(received) {
                *acc += v;
            }
        }

        // --- Phase 2: All-Gather ---
        // Rank r now owns the fully reduced chunk (r + 1); pass it around.
        for step in 0..n - 1 {
            let send_idx = (self.rank + 1 + n - step % n) % n;
            let (start, end) = self.chunk_bounds(send_idx, chunk_size, total);
            let received = self.exchange(data[start..end].to_vec())?;

            let (recv_start, recv_end) = self.chunk_bounds(chunk_of(step), chunk_size, total);
            data[recv_start..recv_end].copy_from_slice(&received[..recv_end - recv_start]);
        }

        trace!(rank = self.rank, total, "ring all-reduce complete");
        Ok(())
    }
}

impl CollectiveBackend for RingBackend {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn reduce_stats(
        &self,
        _key: &str,
        phase: Phase,
        first: &[f32],
        second: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        if first.len() != second.len() {
            return Err(SyncBnError::ShapeMismatch {
                expected: vec![first.len()],
                got: vec![second.len()],
            });
        }

        let mut packed = Vec::with_capacity(first.len() * 2);
        packed.extend_from_slice(first);
        packed.extend_from_slice(second);
        self.all_reduce_sum(&mut packed)?;

        if phase == Phase::Forward {
            let n = self.world_size as f32;
            packed.iter_mut().for_each(|v| *v /= n);
        }
        let second = packed.split_off(first.len());
        Ok((packed, second))
    }
}
