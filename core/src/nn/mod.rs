pub mod config;
pub mod module;
pub mod norm;

pub use config::SyncBatchNormConfig;
pub use module::Module;
pub use norm::{BatchStats, ForwardOutput, Gradients, SyncBatchNorm, derive_variance};
