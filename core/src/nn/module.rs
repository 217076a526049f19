use std::fmt::Debug;

/// Common interface of layers that carry learnable parameters and a
/// training/inference mode.
///
/// `Send + Sync` lets one layer instance per worker live on that worker's
/// thread while sharing read-only handles with others.
pub trait Module: Debug + Send + Sync {
    /// Total number of learnable scalars.
    fn parameter_count(&self) -> usize;

    /// Switches to training mode (batch statistics).
    fn train(&mut self);

    /// Switches to inference mode (moving statistics).
    fn eval(&mut self);

    fn is_training(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct MockModule {
        training: bool,
    }

    impl Module for MockModule {
        fn parameter_count(&self) -> usize {
            3
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

    #[test]
    fn test_module_mode_switch() {
        let mut module = MockModule::default();
        module.train();
        assert!(module.is_training());
        module.eval();
        assert!(!module.is_training());
        assert_eq!(module.parameter_count(), 3);
    }
}
