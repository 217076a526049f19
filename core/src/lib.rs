//! # syncbn
//!
//! Synchronized batch normalization for data-parallel training on one host.
//!
//! Every worker thread runs its own [`nn::SyncBatchNorm`] on a slice of the
//! batch. In training mode the per-channel statistics of all workers are
//! combined through a shared rendezvous before normalizing, so each worker
//! sees the mean and variance of the full global batch.
//!
//! ## Modules
//!
//! - [`distributed`]: Rank assignment, barriers, rendezvous buffers and the
//!   collective backends built on them.
//! - [`nn`]: The synchronized layer and its configuration.
//! - [`mod@tensor`]: A minimal host tensor with a channel axis.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use syncbn::distributed::{RendezvousBackend, SyncContext};
//! use syncbn::nn::{SyncBatchNorm, SyncBatchNormConfig};
//! use syncbn::tensor::Tensor;
//!
//! let ctx = Arc::new(SyncContext::new());
//! let backend = RendezvousBackend::new(ctx, 1).unwrap();
//! let layer = SyncBatchNorm::new(2, SyncBatchNormConfig::new("bn0", 1), backend).unwrap();
//!
//! let x = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 6.0], [2, 2]).unwrap();
//! let out = layer.forward(&x).unwrap();
//! assert_eq!(out.stats.mean, vec![2.0, 4.0]);
//! ```

/// Builds a [`Tensor`] from an array literal; a literal whose length does not
/// match the shape is a compile error.
///
/// ```rust
/// use syncbn::tensor;
///
/// let batch = tensor!([1.0f32, 2.0, 3.0, 6.0], [2, 2]);
/// assert_eq!(batch.channels(), Some(2));
///
/// // Does not compile:
/// // let bad = tensor!([1.0f32, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Length checked above.
        $crate::tensor::Tensor::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod distributed;
pub mod error;
pub mod nn;
pub mod tensor;

pub use error::{Result, SyncBnError};
pub use nn::{SyncBatchNorm, SyncBatchNormConfig};
pub use tensor::{SyncElem, Tensor, TensorElem};
