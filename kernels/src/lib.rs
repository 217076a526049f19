use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_affine;
pub mod cpu_channel;

pub use cpu_affine::{cpu_channel_affine, cpu_channel_grad_input};
pub use cpu_channel::{
    channel_layout, cpu_channel_centered_dot, cpu_channel_scaled_dot, cpu_channel_sum,
    cpu_channel_sum_sq,
};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Per-channel input requires at least 2 dimensions, got shape {0:?}")]
    MissingChannelAxis(Vec<usize>),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Checks that a per-channel parameter slice holds exactly `channels` values.
pub(crate) fn check_channel_param<T>(param: &[T], channels: usize) -> Result<()> {
    if param.len() != channels {
        return Err(KernelError::ShapeMismatch {
            expected: vec![channels],
            got: vec![param.len()],
        });
    }
    Ok(())
}
