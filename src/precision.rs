use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{
    config::TrainError,
    optimizer::{contains_non_finite, LossScaler, LossScalerState, Optimizer},
};

/// Numeric mode of a run, decided once from the model's parameter dtype:
/// 16-bit IEEE floats need dynamic loss scaling, brain floats do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionMode {
    ScaledFp16,
    Bf16,
}

/// Casting policy for the forward region: kernels run in the storage dtype,
/// loss and gradient reductions in full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor, TrainError> {
        if tensor.dtype() == self.reduction {
            Ok(tensor.clone())
        } else {
            Ok(tensor.to_dtype(self.reduction)?)
        }
    }
}

/// Signature of the clipping collaborator handed to `optimizer_step`.
pub type ClipFn = fn(&[Tensor], &mut GradStore, f64) -> Result<f64, TrainError>;

pub struct PrecisionContext {
    mode: PrecisionMode,
    policy: PrecisionPolicy,
    scaler: Option<LossScaler>,
}

impl PrecisionContext {
    pub fn for_parameter_dtype(dtype: DType) -> Self {
        let (mode, scaler) = match dtype {
            DType::F16 => (PrecisionMode::ScaledFp16, Some(LossScaler::new())),
            _ => (PrecisionMode::Bf16, None),
        };
        Self {
            mode,
            policy: PrecisionPolicy {
                storage: dtype,
                reduction: DType::F32,
            },
            scaler,
        }
    }

    pub fn mode(&self) -> PrecisionMode {
        self.mode
    }

    /// Runs the forward pass and loss computation under the casting policy.
    pub fn forward_scope<T>(
        &self,
        f: impl FnOnce(&PrecisionPolicy) -> Result<T, TrainError>,
    ) -> Result<T, TrainError> {
        f(&self.policy)
    }

    /// Backward pass; in fp16 mode the loss is inflated first so small
    /// gradients survive the reduced range.
    pub fn backward(&self, loss: &Tensor) -> Result<GradStore, TrainError> {
        let loss = match &self.scaler {
            Some(scaler) => scaler.scale(loss)?,
            None => loss.clone(),
        };
        Ok(loss.backward()?)
    }

    /// Finishes an accumulation window. In fp16 mode: unscale every gradient,
    /// clip, then either apply the update or skip it when an overflow was
    /// detected, shrinking the scale. In bf16 mode: clip and step
    /// unconditionally. Returns whether the parameter update was applied.
    pub fn optimizer_step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        clip: ClipFn,
        trainable: &[Tensor],
        max_norm: f64,
        grads: &mut GradStore,
    ) -> Result<bool, TrainError> {
        let Some(scaler) = self.scaler.as_mut() else {
            clip(trainable, grads, max_norm)?;
            optimizer.step(grads)?;
            return Ok(true);
        };

        let mut found_inf = false;
        for tensor in trainable {
            if let Some(grad) = grads.remove(tensor) {
                let unscaled = scaler.unscale(&grad)?;
                if !found_inf && contains_non_finite(&unscaled)? {
                    found_inf = true;
                }
                grads.insert(tensor, unscaled);
            }
        }

        if found_inf {
            scaler.update(true);
            return Ok(false);
        }

        clip(trainable, grads, max_norm)?;
        optimizer.step(grads)?;
        scaler.update(false);
        Ok(true)
    }

    pub fn scaler_state(&self) -> Option<LossScalerState> {
        self.scaler.as_ref().map(LossScaler::state)
    }

    pub fn load_scaler_state(&mut self, state: &LossScalerState) {
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.load_state(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::optimizer::{clip_grad_norm, GroupedAdamW, ParameterGroups};
    use candle_core::{Device, Var};

    fn f16_var(data: &[f32]) -> Var {
        let tensor = Tensor::from_slice(data, (data.len(),), &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        Var::from_tensor(&tensor).unwrap()
    }

    fn build_optimizer(var: &Var) -> GroupedAdamW {
        let groups = ParameterGroups::split(
            vec![("w".to_string(), var.clone())],
            0.0,
            |_| true,
        );
        GroupedAdamW::new(
            groups,
            &OptimizerConfig {
                learning_rate: 0.1,
                ..OptimizerConfig::default()
            },
        )
        .unwrap()
    }

    fn window_grads(ctx: &PrecisionContext, var: &Var, inject_overflow: bool) -> GradStore {
        let loss = var
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = ctx.backward(&loss).unwrap();
        if inject_overflow {
            let poisoned =
                Tensor::from_slice(&[f32::INFINITY, 0.0], (2,), &Device::Cpu).unwrap();
            grads.insert(var.as_tensor(), poisoned);
        }
        grads
    }

    #[test]
    fn selects_scaled_mode_for_f16_only() {
        assert_eq!(
            PrecisionContext::for_parameter_dtype(DType::F16).mode(),
            PrecisionMode::ScaledFp16
        );
        assert_eq!(
            PrecisionContext::for_parameter_dtype(DType::BF16).mode(),
            PrecisionMode::Bf16
        );
        assert_eq!(
            PrecisionContext::for_parameter_dtype(DType::F32).mode(),
            PrecisionMode::Bf16
        );
    }

    #[test]
    fn policy_promotes_reductions_to_f32() {
        let ctx = PrecisionContext::for_parameter_dtype(DType::F16);
        ctx.forward_scope(|policy| {
            assert_eq!(policy.storage(), DType::F16);
            assert_eq!(policy.reduction(), DType::F32);
            let half = Tensor::zeros((2,), DType::F16, &Device::Cpu)?;
            assert_eq!(policy.cast_for_reduction(&half)?.dtype(), DType::F32);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn overflow_skips_update_and_shrinks_scale() {
        // Small magnitudes keep the scaled f16 gradients finite.
        let var = f16_var(&[1e-3, -2e-3]);
        let mut optimizer = build_optimizer(&var);
        let mut ctx = PrecisionContext::for_parameter_dtype(DType::F16);
        let trainable = vec![var.as_tensor().clone()];
        let scale_before = ctx.scaler_state().unwrap().scale;
        let params_before = var
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let mut grads = window_grads(&ctx, &var, true);
        let applied = ctx
            .optimizer_step(&mut optimizer, clip_grad_norm, &trainable, 1.0, &mut grads)
            .unwrap();
        assert!(!applied);

        let params_after = var
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(params_before, params_after);
        assert!(ctx.scaler_state().unwrap().scale < scale_before);

        // The next clean window proceeds normally.
        let mut grads = window_grads(&ctx, &var, false);
        let applied = ctx
            .optimizer_step(&mut optimizer, clip_grad_norm, &trainable, 1.0, &mut grads)
            .unwrap();
        assert!(applied);
        let params_final = var
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_ne!(params_after, params_final);
    }

    #[test]
    fn bf16_mode_steps_unconditionally() {
        let tensor = Tensor::from_slice(&[1.0f32, 2.0], (2,), &Device::Cpu).unwrap();
        let var = Var::from_tensor(&tensor).unwrap();
        let mut optimizer = build_optimizer(&var);
        let mut ctx = PrecisionContext::for_parameter_dtype(DType::F32);
        let trainable = vec![var.as_tensor().clone()];

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = ctx.backward(&loss).unwrap();
        let applied = ctx
            .optimizer_step(&mut optimizer, clip_grad_norm, &trainable, 1.0, &mut grads)
            .unwrap();
        assert!(applied);
        assert!(ctx.scaler_state().is_none());
    }
}
