use super::config::SyncBatchNormConfig;
use super::module::Module;
use crate::distributed::{CollectiveBackend, Phase};
use crate::error::{Result, SyncBnError};
use crate::tensor::{SyncElem, Tensor, ensure_single_precision};
use rayon::prelude::*;
use syncbn_kernels::{
    channel_layout, cpu_channel_affine, cpu_channel_centered_dot, cpu_channel_grad_input,
    cpu_channel_scaled_dot, cpu_channel_sum, cpu_channel_sum_sq,
};
use tracing::{debug, instrument};

/// Per-channel statistics produced by a forward pass.
///
/// `mean` and `var` are the values the batch was normalized with: the
/// cross-worker statistics in training mode, the moving statistics otherwise.
/// `local_mean` and `local_var` are this worker's own batch statistics and feed
/// the moving averages on the next backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub mean: Vec<f32>,
    pub var: Vec<f32>,
    pub local_mean: Vec<f32>,
    pub local_var: Vec<f32>,
}

impl BatchStats {
    pub fn channels(&self) -> usize {
        self.mean.len()
    }
}

/// Result of [`SyncBatchNorm::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput<T: SyncElem, const RANK: usize> {
    pub output: Tensor<T, RANK>,
    pub stats: BatchStats,
    mean_var_visible: bool,
}

impl<T: SyncElem, const RANK: usize> ForwardOutput<T, RANK> {
    /// 3 when the batch mean and variance are exposed as outputs, 1 otherwise.
    pub fn visible_outputs(&self) -> usize {
        if self.mean_var_visible { 3 } else { 1 }
    }

    /// The batch mean and variance, when the layer was configured to expose them.
    pub fn mean_var(&self) -> Option<(&[f32], &[f32])> {
        self.mean_var_visible
            .then(|| (self.stats.mean.as_slice(), self.stats.var.as_slice()))
    }
}

/// Result of [`SyncBatchNorm::backward`].
///
/// `gamma` and `beta` hold this worker's partial sums; summing them across
/// workers gives the gradient of the full global batch.
#[derive(Debug, Clone)]
pub struct Gradients<T: SyncElem, const RANK: usize> {
    pub input: Tensor<T, RANK>,
    pub gamma: Tensor<f32, 1>,
    pub beta: Tensor<f32, 1>,
}

/// Batch normalization whose batch statistics span every worker of a group.
///
/// Each worker owns one instance with the same key and calls `forward` and
/// `backward` with its local slice of the batch. In training mode both passes
/// block until all `ndev` workers of the group have contributed, so every
/// worker normalizes with the same mean and variance.
///
/// Inputs are `[N, C, ...]`; statistics are taken over every axis except the
/// channel axis. Only single-precision element types are accepted.
#[derive(Debug)]
pub struct SyncBatchNorm<B: CollectiveBackend> {
    pub gamma: Tensor<f32, 1>,
    pub beta: Tensor<f32, 1>,
    pub moving_mean: Tensor<f32, 1>,
    pub moving_var: Tensor<f32, 1>,
    config: SyncBatchNormConfig,
    backend: B,
    training: bool,
}

impl<B: CollectiveBackend + std::fmt::Debug> SyncBatchNorm<B> {
    /// Creates a layer over `channels` channels in training mode.
    ///
    /// `gamma` starts at 1, `beta` at 0, the moving mean at 0 and the moving
    /// variance at 1.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::InvalidConfig` if the configuration does not
    /// validate or the backend's world size differs from `config.ndev`.
    pub fn new(channels: usize, config: SyncBatchNormConfig, backend: B) -> Result<Self> {
        config.validate()?;
        if backend.world_size() != config.ndev {
            return Err(SyncBnError::InvalidConfig(format!(
                "backend spans {} workers but ndev is {}",
                backend.world_size(),
                config.ndev
            )));
        }
        Ok(Self {
            gamma: Tensor::ones([channels]),
            beta: Tensor::zeros([channels]),
            moving_mean: Tensor::zeros([channels]),
            moving_var: Tensor::ones([channels]),
            config,
            backend,
            training: true,
        })
    }

    pub fn config(&self) -> &SyncBatchNormConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn channels(&self) -> usize {
        self.gamma.size()
    }

    /// Whether the next pass normalizes with cross-worker batch statistics.
    pub fn uses_batch_stats(&self) -> bool {
        self.training && !self.config.use_global_stats
    }

    fn slope(&self) -> Vec<f32> {
        if self.config.fix_gamma {
            vec![1.0; self.channels()]
        } else {
            self.gamma.data().to_vec()
        }
    }

    fn check_input(&self, shape: &[usize]) -> Result<(usize, usize, usize)> {
        let (outer, channels, inner) = channel_layout(shape)?;
        if channels != self.channels() {
            return Err(SyncBnError::ShapeMismatch {
                expected: vec![self.channels()],
                got: vec![channels],
            });
        }
        Ok((outer, channels, inner))
    }

    fn inv_std(&self, var: &[f32]) -> Vec<f32> {
        var.iter()
            .map(|&v| 1.0 / (v + self.config.eps).sqrt())
            .collect()
    }

    /// Normalizes `x` and returns the output with the statistics used.
    ///
    /// # Errors
    ///
    /// * `SyncBnError::UnsupportedPrecision` for non-`f32` elements, before any
    ///   synchronization takes place.
    /// * `SyncBnError::ShapeMismatch` / `SyncBnError::Kernel` if `x` is not
    ///   `[N, C, ...]` with `C` matching the layer.
    /// * `SyncBnError::Unsupported` for an empty batch in training mode.
    #[instrument(level = "debug", skip_all, fields(key = %self.config.key))]
    pub fn forward<T: SyncElem, const RANK: usize>(
        &self,
        x: &Tensor<T, RANK>,
    ) -> Result<ForwardOutput<T, RANK>> {
        ensure_single_precision::<T>()?;
        let shape = x.shape();
        let (outer, channels, inner) = self.check_input(shape)?;
        let data = to_stat(x.data());
        let slope = self.slope();

        let stats = if self.uses_batch_stats() {
            let count = outer * inner;
            if count == 0 {
                return Err(SyncBnError::Unsupported(
                    "batch statistics of an empty batch".to_string(),
                ));
            }
            let scale = 1.0 / count as f32;
            let local_mean: Vec<f32> = cpu_channel_sum(&data, shape)?
                .into_iter()
                .map(|s| s * scale)
                .collect();
            let local_sq: Vec<f32> = cpu_channel_sum_sq(&data, shape)?
                .into_iter()
                .map(|s| s * scale)
                .collect();
            let local_var = derive_variance(&local_mean, &local_sq);

            let (mean, global_sq) =
                self.backend
                    .reduce_stats(&self.config.key, Phase::Forward, &local_mean, &local_sq)?;
            let var = derive_variance(&mean, &global_sq);
            debug!(channels, count, "synchronized forward statistics");
            BatchStats {
                mean,
                var,
                local_mean,
                local_var,
            }
        } else {
            let mean = self.moving_mean.data().to_vec();
            let var = self.moving_var.data().to_vec();
            BatchStats {
                local_mean: mean.clone(),
                local_var: var.clone(),
                mean,
                var,
            }
        };

        let inv_std = self.inv_std(&stats.var);
        let scale: Vec<f32> = slope.iter().zip(&inv_std).map(|(s, i)| s * i).collect();
        let shift: Vec<f32> = self
            .beta
            .data()
            .iter()
            .zip(&stats.mean)
            .zip(&scale)
            .map(|((b, m), s)| b - m * s)
            .collect();
        let out = cpu_channel_affine(&data, shape, &scale, &shift)?;

        Ok(ForwardOutput {
            output: Tensor::new(from_stat(out), *shape)?,
            stats,
            mean_var_visible: self.config.output_mean_var,
        })
    }

    /// Back-propagates `grad_out` through the layer.
    ///
    /// `x` and `stats` must be the input and statistics of the matching
    /// forward call. In training mode the moving statistics are updated from
    /// this worker's local batch statistics once the gradient sums have been
    /// synchronized; a failed call leaves them untouched.
    #[instrument(level = "debug", skip_all, fields(key = %self.config.key))]
    pub fn backward<T: SyncElem, const RANK: usize>(
        &mut self,
        grad_out: &Tensor<T, RANK>,
        x: &Tensor<T, RANK>,
        stats: &BatchStats,
    ) -> Result<Gradients<T, RANK>> {
        ensure_single_precision::<T>()?;
        if grad_out.shape() != x.shape() {
            return Err(SyncBnError::ShapeMismatch {
                expected: x.shape().to_vec(),
                got: grad_out.shape().to_vec(),
            });
        }
        let shape = x.shape();
        let (outer, channels, inner) = self.check_input(shape)?;
        if stats.channels() != channels
            || stats.var.len() != channels
            || stats.local_mean.len() != channels
            || stats.local_var.len() != channels
        {
            return Err(SyncBnError::ShapeMismatch {
                expected: vec![channels],
                got: vec![stats.channels()],
            });
        }

        let grad = to_stat(grad_out.data());
        let data = to_stat(x.data());
        let slope = self.slope();
        let sum_grad = cpu_channel_sum(&grad, shape)?;

        let (grad_in, grad_gamma) = if self.uses_batch_stats() {
            let cross = cpu_channel_centered_dot(&grad, &data, &stats.mean, shape)?;
            let (global_grad, global_cross) =
                self.backend
                    .reduce_stats(&self.config.key, Phase::Backward, &sum_grad, &cross)?;
            self.update_moving_stats(&stats.local_mean, &stats.local_var);

            let count = outer * inner * self.config.ndev;
            let m_inv = 1.0 / count as f32;
            let inv_std = self.inv_std(&stats.var);
            let mut a = vec![0.0f32; channels];
            let mut b = vec![0.0f32; channels];
            let mut d = vec![0.0f32; channels];
            for c in 0..channels {
                let var_eps = stats.var[c] + self.config.eps;
                let grad_var = -0.5 * global_cross[c] * slope[c] * var_eps.powf(-1.5);
                let grad_mean = -global_grad[c] * slope[c] * inv_std[c];
                a[c] = slope[c] * inv_std[c];
                b[c] = grad_var * 2.0 * m_inv;
                d[c] = grad_mean * m_inv;
            }
            debug!(channels, count, "synchronized backward sums");

            let grad_in = cpu_channel_grad_input(&grad, &data, shape, &stats.mean, &a, &b, &d)?;
            let grad_gamma = if self.config.fix_gamma {
                vec![0.0; channels]
            } else {
                cpu_channel_scaled_dot(&grad, &data, &stats.mean, &inv_std, shape)?
            };
            (grad_in, grad_gamma)
        } else {
            let mean = self.moving_mean.data().to_vec();
            let inv_std = self.inv_std(self.moving_var.data());
            let scale: Vec<f32> = slope.iter().zip(&inv_std).map(|(s, i)| s * i).collect();
            let grad_in = cpu_channel_affine(&grad, shape, &scale, &vec![0.0; channels])?;
            let grad_gamma = if self.config.fix_gamma {
                vec![0.0; channels]
            } else {
                cpu_channel_scaled_dot(&grad, &data, &mean, &inv_std, shape)?
            };
            (grad_in, grad_gamma)
        };

        Ok(Gradients {
            input: Tensor::new(from_stat(grad_in), *shape)?,
            gamma: Tensor::new(grad_gamma, [channels])?,
            beta: Tensor::new(sum_grad, [channels])?,
        })
    }

    fn update_moving_stats(&mut self, mean: &[f32], var: &[f32]) {
        let momentum = self.config.momentum;
        for (mm, &m) in self.moving_mean.data_mut().iter_mut().zip(mean) {
            *mm = *mm * momentum + m * (1.0 - momentum);
        }
        for (mv, &v) in self.moving_var.data_mut().iter_mut().zip(var) {
            *mv = *mv * momentum + v * (1.0 - momentum);
        }
    }
}

impl<B: CollectiveBackend + std::fmt::Debug> Module for SyncBatchNorm<B> {
    fn parameter_count(&self) -> usize {
        self.gamma.size() + self.beta.size()
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

fn to_stat<T: SyncElem>(data: &[T]) -> Vec<f32> {
    data.par_iter().map(|&v| v.into_stat()).collect()
}

fn from_stat<T: SyncElem>(data: Vec<f32>) -> Vec<T> {
    data.into_par_iter().map(T::from_stat).collect()
}

/// `var = E[x²] − mean²`, per channel.
pub fn derive_variance(mean: &[f32], second_moment: &[f32]) -> Vec<f32> {
    mean.iter()
        .zip(second_moment)
        .map(|(&m, &sq)| sq - m * m)
        .collect()
}
