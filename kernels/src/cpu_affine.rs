use crate::cpu_channel::channel_layout;
use crate::{KernelElem, KernelError, Result, check_channel_param};
use rayon::prelude::*;

fn check_len<T>(data: &[T], size: usize) -> Result<()> {
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    Ok(())
}

/// Applies a per-channel affine map `y = x * scale[c] + shift[c]`.
///
/// Both the training normalization (`scale = gamma / std`, `shift = beta - mean * scale`)
/// and the inference path with frozen moving statistics reduce to this kernel.
///
/// # Arguments
///
/// * `input` - Input tensor data (flattened). Shape: `[batch_size, channels, ...]`
/// * `shape` - Shape of the input tensor.
/// * `scale` - Per-channel multiplier of length `channels`.
/// * `shift` - Per-channel offset of length `channels`.
pub fn cpu_channel_affine<T: KernelElem>(
    input: &[T],
    shape: &[usize],
    scale: &[T],
    shift: &[T],
) -> Result<Vec<T>> {
    let (_, channels, inner) = channel_layout(shape)?;
    check_len(input, shape.iter().product())?;
    check_channel_param(scale, channels)?;
    check_channel_param(shift, channels)?;

    let mut output = vec![T::zero(); input.len()];
    if inner == 0 || channels == 0 {
        return Ok(output);
    }

    // Every `inner`-sized run belongs to one (batch, channel) pair.
    output
        .par_chunks_mut(inner)
        .zip(input.par_chunks(inner))
        .enumerate()
        .for_each(|(run, (out_run, in_run))| {
            let c = run % channels;
            let (s, b) = (scale[c], shift[c]);
            for (o, &x) in out_run.iter_mut().zip(in_run) {
                *o = x * s + b;
            }
        });

    Ok(output)
}

/// Input gradient of batch normalization,
/// `dx = dy * a[c] + (x - center[c]) * b[c] + d[c]`.
///
/// For the synchronized layer `a = gamma / std`, `b = 2 * grad_var / m`,
/// `d = grad_mean / m`, and `center` is the global batch mean.
pub fn cpu_channel_grad_input<T: KernelElem>(
    grad: &[T],
    input: &[T],
    shape: &[usize],
    center: &[T],
    a: &[T],
    b: &[T],
    d: &[T],
) -> Result<Vec<T>> {
    let (_, channels, inner) = channel_layout(shape)?;
    let size = shape.iter().product();
    check_len(grad, size)?;
    check_len(input, size)?;
    for param in [center, a, b, d] {
        check_channel_param(param, channels)?;
    }

    let mut output = vec![T::zero(); size];
    if inner == 0 || channels == 0 {
        return Ok(output);
    }

    output
        .par_chunks_mut(inner)
        .zip(grad.par_chunks(inner).zip(input.par_chunks(inner)))
        .enumerate()
        .for_each(|(run, (out_run, (g_run, x_run)))| {
            let c = run % channels;
            for ((o, &g), &x) in out_run.iter_mut().zip(g_run).zip(x_run) {
                *o = g * a[c] + (x - center[c]) * b[c] + d[c];
            }
        });

    Ok(output)
}
