use rand::Rng;
use std::error::Error;
use std::sync::Arc;
use std::thread;
use syncbn::distributed::{Phase, RendezvousBackend, SyncContext};
use syncbn::nn::{Module, SyncBatchNorm, SyncBatchNormConfig};
use syncbn::tensor::Tensor;
use syncbn::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WORKERS: usize = 4;
const CHANNELS: usize = 3;
const LOCAL_BATCH: usize = 8;
const SPATIAL: usize = 16;
const STEPS: usize = 50;
const LEARNING_RATE: f32 = 0.5;

/// Final `(gamma, beta)` of one worker.
type Replica = (Vec<f32>, Vec<f32>);

/// Per-channel data distribution; each worker draws a differently shifted slice.
fn sample_batch(worker: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    let shift = worker as f32 * 0.5;
    (0..LOCAL_BATCH * CHANNELS * SPATIAL)
        .map(|i| {
            let c = (i / SPATIAL) % CHANNELS;
            (c as f32 + 1.0) * rng.random_range(-1.0..1.0) + c as f32 + shift
        })
        .collect()
}

/// Data-parallel fit of the layer's affine parameters to a fixed target map.
///
/// Every worker normalizes with statistics of the global batch, then sums its
/// parameter gradients with the others so all replicas take identical steps.
fn train_worker(worker: usize, ctx: Arc<SyncContext>) -> Result<Replica> {
    let backend = RendezvousBackend::new(Arc::clone(&ctx), WORKERS)?;
    let config = SyncBatchNormConfig::new("demo_bn", WORKERS)
        .with_fix_gamma(false)
        .with_eps(1e-5);
    let mut layer = SyncBatchNorm::new(CHANNELS, config, backend)?;
    let shape = [LOCAL_BATCH, CHANNELS, SPATIAL];

    for step in 0..STEPS {
        let x = Tensor::new(sample_batch(worker), shape)?;
        let out = layer.forward(&x)?;

        // Target: 2 * x_hat + 1 on every channel.
        let target_gamma = 2.0;
        let target_beta = 1.0;
        let mut loss = 0.0f32;
        let grad: Vec<f32> = out
            .output
            .data()
            .iter()
            .zip(x.data())
            .enumerate()
            .map(|(i, (&y, &xv))| {
                let c = (i / SPATIAL) % CHANNELS;
                let x_hat = (xv - out.stats.mean[c]) / (out.stats.var[c] + 1e-5).sqrt();
                let diff = y - (target_gamma * x_hat + target_beta);
                loss += 0.5 * diff * diff;
                diff / (WORKERS * LOCAL_BATCH * SPATIAL) as f32
            })
            .collect();
        let grad = Tensor::new(grad, shape)?;
        let grads = layer.backward(&grad, &x, &out.stats)?;

        let (grad_gamma, grad_beta) = ctx.all_reduce_pair(
            "demo_params",
            Phase::Backward,
            WORKERS,
            grads.gamma.data(),
            grads.beta.data(),
        )?;
        for (g, dg) in layer.gamma.data_mut().iter_mut().zip(&grad_gamma) {
            *g -= LEARNING_RATE * dg;
        }
        for (b, db) in layer.beta.data_mut().iter_mut().zip(&grad_beta) {
            *b -= LEARNING_RATE * db;
        }

        if worker == 0 && step % 10 == 0 {
            info!(step, loss, gamma = ?layer.gamma.data(), "training");
        }
    }

    layer.eval();
    let probe = Tensor::new(sample_batch(worker), shape)?;
    let eval_out = layer.forward(&probe)?;
    info!(
        worker,
        moving_mean = ?layer.moving_mean.data(),
        first = eval_out.output.data()[0],
        "evaluation pass"
    );

    Ok((layer.gamma.into_data(), layer.beta.into_data()))
}

/// Fails unless every replica holds exactly the parameters of the first one.
fn check_replicas(replicas: &[Replica]) -> std::result::Result<(), String> {
    let Some((gamma, beta)) = replicas.first() else {
        return Err("no replicas finished".to_string());
    };
    match replicas
        .iter()
        .position(|(g, b)| g != gamma || b != beta)
    {
        Some(worker) => Err(format!(
            "worker {} diverged from worker 0: gamma {:?} vs {:?}",
            worker, replicas[worker].0, gamma
        )),
        None => Ok(()),
    }
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(workers = WORKERS, channels = CHANNELS, "starting synchronized training");
    let ctx = Arc::new(SyncContext::new());

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || train_worker(worker, ctx))
        })
        .collect();

    let mut replicas = Vec::with_capacity(WORKERS);
    for handle in handles {
        match handle.join() {
            Ok(result) => replicas.push(result?),
            Err(panic) => {
                warn!("worker panicked");
                std::panic::resume_unwind(panic);
            }
        }
    }

    ctx.clear();
    if let Err(reason) = check_replicas(&replicas) {
        warn!(%reason, "replicas out of sync");
        return Err(reason.into());
    }
    let (gamma, beta) = &replicas[0];
    info!(?gamma, ?beta, "finished with replicas in sync");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_replicas() {
        let same = vec![(vec![1.0, 2.0], vec![0.5]); 3];
        assert!(check_replicas(&same).is_ok());

        let mut diverged = same.clone();
        diverged[2].0[1] = 2.5;
        let err = check_replicas(&diverged).unwrap_err();
        assert!(err.contains("worker 2"));

        assert!(check_replicas(&[]).is_err());
    }
}
