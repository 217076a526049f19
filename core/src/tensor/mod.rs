//! Minimal CPU tensor used by the normalization layer.
//!
//! A `Tensor` is a flat, row-major `Vec<T>` plus a const-rank shape. Batch
//! normalization treats axis 1 as the channel axis: a `[N, C]` input is
//! normalized per column, a `[N, C, H, W]` input per feature map.
//!
//! ```rust
//! use syncbn::tensor::Tensor;
//!
//! let tensor = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.channels(), Some(3));
//! ```

use crate::error::{Result, SyncBnError};
use num_traits::{Float, FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory.
/// - `Num + ...`: Provides necessary numeric operations for tensor math.
/// - `Send + Sync`: Required for parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// Floating point elements accepted at the synchronized layer boundary.
///
/// Statistics always travel through the rendezvous engine as `f32`.
/// Element types that would be silently narrowed on the way in report
/// `SINGLE_PRECISION = false` and are rejected before any synchronization.
pub trait SyncElem: TensorElem + Float + 'static {
    const DTYPE_NAME: &'static str;
    const SINGLE_PRECISION: bool;

    fn into_stat(self) -> f32;
    fn from_stat(value: f32) -> Self;
}

impl SyncElem for f32 {
    const DTYPE_NAME: &'static str = "f32";
    const SINGLE_PRECISION: bool = true;

    fn into_stat(self) -> f32 {
        self
    }

    fn from_stat(value: f32) -> Self {
        value
    }
}

impl SyncElem for f64 {
    const DTYPE_NAME: &'static str = "f64";
    const SINGLE_PRECISION: bool = false;

    fn into_stat(self) -> f32 {
        self as f32
    }

    fn from_stat(value: f32) -> Self {
        value as f64
    }
}

/// Returns an error unless `T` is a single-precision element type.
pub fn ensure_single_precision<T: SyncElem>() -> Result<()> {
    if T::SINGLE_PRECISION {
        Ok(())
    } else {
        Err(SyncBnError::UnsupportedPrecision(T::DTYPE_NAME))
    }
}

/// An N-dimensional array stored contiguously on the host.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `SyncBnError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(SyncBnError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self { shape, data })
    }

    /// Creates a new Tensor where every element equals `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Size of the channel axis (axis 1), if the tensor has one.
    pub fn channels(&self) -> Option<usize> {
        self.shape.get(1).copied()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Total number of elements (product of the shape).
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let tensor = Tensor::<f32, 2>::new(data.clone(), [2, 2]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.data(), &data[..]);

        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(SyncBnError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zeros_ones_full() {
        assert_eq!(Tensor::<f32, 2>::zeros([2, 3]).data(), &[0.0; 6]);
        assert_eq!(Tensor::<f32, 1>::ones([3]).data(), &[1.0; 3]);
        assert_eq!(Tensor::<f32, 1>::full([2], 0.5).data(), &[0.5, 0.5]);
    }

    #[test]
    fn test_channels() {
        assert_eq!(Tensor::<f32, 4>::zeros([2, 3, 4, 4]).channels(), Some(3));
        assert_eq!(Tensor::<f32, 1>::zeros([5]).channels(), None);
    }

    #[test]
    fn test_precision_gate() {
        assert!(ensure_single_precision::<f32>().is_ok());
        assert!(matches!(
            ensure_single_precision::<f64>(),
            Err(SyncBnError::UnsupportedPrecision("f64"))
        ));
    }

    #[test]
    fn test_tensor_debug() {
        let t = Tensor::<f32, 2>::zeros([2, 2]);
        let dbg = format!("{:?}", t);
        assert!(dbg.contains("shape: [2, 2]"));
        assert!(dbg.contains("data_len: 4"));
    }
}
