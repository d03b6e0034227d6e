use candle_core::{DType, Tensor, Var};

use crate::{config::TrainError, data::MicroBatch};

/// Contract the loop consumes a model through.
///
/// The forward pass returns the loss directly, normalized by the supplied
/// count of target positions — the count is shared across every micro-batch
/// of an accumulation window, so short windows do not bias the gradient.
///
/// Models that wrap a delegate (adapters, quantization shells) surface it via
/// `delegate_mut` so mode changes reach every node of the ownership chain.
pub trait TrainableModel {
    /// Loss for one micro-batch, normalized by `normalization_count`.
    fn forward(
        &self,
        batch: &MicroBatch,
        normalization_count: usize,
    ) -> Result<Tensor, TrainError>;

    /// Named parameters flagged for gradient computation. Frozen parameters
    /// must not appear here.
    fn trainable_parameters(&self) -> Vec<(String, Var)>;

    /// Storage dtype of the weights; drives precision-mode selection.
    fn parameter_dtype(&self) -> DType;

    /// Flips this node's own training flag. Use [`set_training_mode`] to flip
    /// the whole chain.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// The wrapped sub-model, if any.
    fn delegate_mut(&mut self) -> Option<&mut dyn TrainableModel> {
        None
    }
}

/// Marks the entire model chain as training or evaluating by walking the
/// delegate links recursively.
pub fn set_training_mode(node: &mut dyn TrainableModel, training: bool) {
    node.set_training(training);
    if let Some(child) = node.delegate_mut() {
        set_training_mode(child, training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    struct Leaf {
        training: bool,
    }

    impl TrainableModel for Leaf {
        fn forward(&self, _batch: &MicroBatch, _n: usize) -> Result<Tensor, TrainError> {
            Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?)
        }

        fn trainable_parameters(&self) -> Vec<(String, Var)> {
            Vec::new()
        }

        fn parameter_dtype(&self) -> DType {
            DType::F32
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }
    }

    struct Shell {
        training: bool,
        inner: Leaf,
    }

    impl TrainableModel for Shell {
        fn forward(&self, batch: &MicroBatch, n: usize) -> Result<Tensor, TrainError> {
            self.inner.forward(batch, n)
        }

        fn trainable_parameters(&self) -> Vec<(String, Var)> {
            self.inner.trainable_parameters()
        }

        fn parameter_dtype(&self) -> DType {
            self.inner.parameter_dtype()
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }

        fn delegate_mut(&mut self) -> Option<&mut dyn TrainableModel> {
            Some(&mut self.inner)
        }
    }

    #[test]
    fn mode_walk_reaches_nested_delegates() {
        let mut model = Shell {
            training: false,
            inner: Leaf { training: false },
        };
        set_training_mode(&mut model, true);
        assert!(model.training && model.inner.training);
        set_training_mode(&mut model, false);
        assert!(!model.training && !model.inner.training);
    }
}
