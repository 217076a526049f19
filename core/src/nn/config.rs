use crate::error::{Result, SyncBnError};
use serde::{Deserialize, Serialize};

/// Hyper-parameters of a [`SyncBatchNorm`](super::SyncBatchNorm) layer.
///
/// Deserializes with per-field defaults, so `{"key": "bn1_", "ndev": 4}` is a
/// complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncBatchNormConfig {
    /// Added to the variance before the square root.
    pub eps: f32,
    /// Decay of the moving statistics: `moving = moving * momentum + batch * (1 - momentum)`.
    pub momentum: f32,
    /// Treat the scale as constant 1 and report a zero scale gradient.
    pub fix_gamma: bool,
    /// Normalize with the moving statistics even while training. Disables synchronization.
    pub use_global_stats: bool,
    /// Expose the batch mean and variance as visible outputs.
    pub output_mean_var: bool,
    /// Number of workers that synchronize on this layer.
    pub ndev: usize,
    /// Synchronization key; identical on every worker, unique per layer instance.
    pub key: String,
}

impl Default for SyncBatchNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-3,
            momentum: 0.9,
            fix_gamma: true,
            use_global_stats: false,
            output_mean_var: false,
            ndev: 1,
            key: String::new(),
        }
    }
}

impl SyncBatchNormConfig {
    pub fn new(key: impl Into<String>, ndev: usize) -> Self {
        Self {
            key: key.into(),
            ndev,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    #[must_use]
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    #[must_use]
    pub fn with_fix_gamma(mut self, fix_gamma: bool) -> Self {
        self.fix_gamma = fix_gamma;
        self
    }

    #[must_use]
    pub fn with_use_global_stats(mut self, use_global_stats: bool) -> Self {
        self.use_global_stats = use_global_stats;
        self
    }

    #[must_use]
    pub fn with_output_mean_var(mut self, output_mean_var: bool) -> Self {
        self.output_mean_var = output_mean_var;
        self
    }

    /// Checks every field for values the layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ndev == 0 {
            return Err(SyncBnError::InvalidConfig(
                "ndev must be at least 1".to_string(),
            ));
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(SyncBnError::InvalidConfig(format!(
                "eps must be a positive finite number, got {}",
                self.eps
            )));
        }
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(SyncBnError::InvalidConfig(format!(
                "momentum must be in [0, 1], got {}",
                self.momentum
            )));
        }
        if self.ndev > 1 && self.key.is_empty() {
            return Err(SyncBnError::InvalidConfig(
                "a synchronization key is required when ndev > 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncBatchNormConfig::default();
        assert_eq!(config.eps, 1e-3);
        assert_eq!(config.momentum, 0.9);
        assert!(config.fix_gamma);
        assert!(!config.use_global_stats);
        assert!(!config.output_mean_var);
        assert_eq!(config.ndev, 1);
        assert!(config.key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SyncBatchNormConfig::new("bn2_", 4)
            .with_eps(1e-5)
            .with_momentum(0.99)
            .with_fix_gamma(false)
            .with_output_mean_var(true);
        assert_eq!(config.key, "bn2_");
        assert_eq!(config.ndev, 4);
        assert_eq!(config.eps, 1e-5);
        assert!(!config.fix_gamma);
        assert!(config.output_mean_var);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SyncBatchNormConfig::new("k", 0).validate().is_err());
        assert!(SyncBatchNormConfig::new("", 2).validate().is_err());
        assert!(
            SyncBatchNormConfig::new("k", 2)
                .with_eps(0.0)
                .validate()
                .is_err()
        );
        assert!(
            SyncBatchNormConfig::new("k", 2)
                .with_eps(f32::NAN)
                .validate()
                .is_err()
        );
        assert!(
            SyncBatchNormConfig::new("k", 2)
                .with_momentum(1.5)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SyncBatchNormConfig =
            serde_json::from_str(r#"{"key": "stage3_bn", "ndev": 8, "fix_gamma": false}"#)
                .unwrap();
        assert_eq!(config.key, "stage3_bn");
        assert_eq!(config.ndev, 8);
        assert!(!config.fix_gamma);
        assert_eq!(config.eps, 1e-3);
        assert_eq!(config.momentum, 0.9);
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = SyncBatchNormConfig::new("bn", 2).with_use_global_stats(true);
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncBatchNormConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
