use crate::{KernelElem, KernelError, Result, check_channel_param};
use rayon::prelude::*;

/// Splits a shape `[N, C, d2, d3, ...]` into `(outer, channels, inner)`.
///
/// `outer` is the batch extent, `inner` the product of all trailing spatial
/// dimensions (1 for a 2-D `[N, C]` input). Channel `c` of batch item `n`
/// occupies `input[(n * channels + c) * inner..][..inner]`.
pub fn channel_layout(shape: &[usize]) -> Result<(usize, usize, usize)> {
    if shape.len() < 2 {
        return Err(KernelError::MissingChannelAxis(shape.to_vec()));
    }
    let inner = shape[2..].iter().product();
    Ok((shape[0], shape[1], inner))
}

fn checked_layout<T>(input: &[T], shape: &[usize]) -> Result<(usize, usize, usize)> {
    let layout = channel_layout(shape)?;
    let size: usize = shape.iter().product();
    if input.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![input.len()],
        });
    }
    Ok(layout)
}

/// Folds every element belonging to channel `c` with `f(value, index)`.
fn fold_channel<T, F>(outer: usize, channels: usize, inner: usize, c: usize, f: F) -> T
where
    T: KernelElem,
    F: Fn(usize) -> T,
{
    let mut acc = T::zero();
    for n in 0..outer {
        let base = (n * channels + c) * inner;
        for i in 0..inner {
            acc += f(base + i);
        }
    }
    acc
}

/// Sums `input` over every axis except the channel axis (axis 1).
///
/// # Arguments
///
/// * `input` - Input tensor data (flattened). Shape: `[batch_size, channels, ...]`
/// * `shape` - Shape of the input tensor.
///
/// # Returns
///
/// A vector of length `channels`.
pub fn cpu_channel_sum<T: KernelElem>(input: &[T], shape: &[usize]) -> Result<Vec<T>> {
    let (outer, channels, inner) = checked_layout(input, shape)?;
    Ok((0..channels)
        .into_par_iter()
        .map(|c| fold_channel(outer, channels, inner, c, |idx| input[idx]))
        .collect())
}

/// Per-channel sum of squares, `Σ x²` over every axis except axis 1.
pub fn cpu_channel_sum_sq<T: KernelElem>(input: &[T], shape: &[usize]) -> Result<Vec<T>> {
    let (outer, channels, inner) = checked_layout(input, shape)?;
    Ok((0..channels)
        .into_par_iter()
        .map(|c| {
            fold_channel(outer, channels, inner, c, |idx| {
                let v = input[idx];
                v * v
            })
        })
        .collect())
}

/// Per-channel `Σ a · (b − center[c])`.
///
/// With `a` the output gradient and `b` the layer input this is the
/// cross term used by the batch-norm backward pass.
pub fn cpu_channel_centered_dot<T: KernelElem>(
    a: &[T],
    b: &[T],
    center: &[T],
    shape: &[usize],
) -> Result<Vec<T>> {
    let (outer, channels, inner) = checked_layout(a, shape)?;
    checked_layout(b, shape)?;
    check_channel_param(center, channels)?;

    Ok((0..channels)
        .into_par_iter()
        .map(|c| {
            let mu = center[c];
            fold_channel(outer, channels, inner, c, |idx| a[idx] * (b[idx] - mu))
        })
        .collect())
}

/// Per-channel `Σ a · (b − center[c]) · scale[c]`.
pub fn cpu_channel_scaled_dot<T: KernelElem>(
    a: &[T],
    b: &[T],
    center: &[T],
    scale: &[T],
    shape: &[usize],
) -> Result<Vec<T>> {
    check_channel_param(scale, channel_layout(shape)?.1)?;
    let mut out = cpu_channel_centered_dot(a, b, center, shape)?;
    out.iter_mut().zip(scale).for_each(|(o, &s)| *o *= s);
    Ok(out)
}
