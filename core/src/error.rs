use syncbn_kernels::KernelError;
use thiserror::Error;

/// Error type for tensor, synchronization and layer operations.
///
/// A worker that never arrives (or an extra one) is not represented here:
/// that misconfiguration shows up as blocking, not as an error.
#[derive(Error, Debug)]
pub enum SyncBnError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// The element type cannot flow through the synchronization engine.
    #[error("Synchronized BatchNorm does not support {0} precision")]
    UnsupportedPrecision(&'static str),
    /// A slot index outside `[0, world_size)`.
    #[error("Rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
    /// A group needs at least one participant.
    #[error("Invalid world size {0}: at least one participant is required")]
    InvalidWorldSize(usize),
    /// A ring neighbour hung up mid-collective.
    #[error("Ring peer of rank {rank} disconnected")]
    PeerDisconnected { rank: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, SyncBnError>;
