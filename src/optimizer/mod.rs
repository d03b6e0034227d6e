use std::collections::HashMap;

pub mod scaler;

pub use scaler::{contains_non_finite, LossScaleConfig, LossScaler, LossScalerState};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerConfig, OptimizerKind, TrainError};

const EPS: f64 = 1e-12;

/// Trainable parameters sharing one weight-decay coefficient.
#[derive(Debug)]
pub struct ParameterGroup {
    pub params: Vec<(String, Var)>,
    pub weight_decay: f64,
}

/// The two groups every run has: decayed and undecayed. Membership is decided
/// once, before the loop starts, and never changes.
#[derive(Debug)]
pub struct ParameterGroups {
    pub decay: ParameterGroup,
    pub no_decay: ParameterGroup,
}

impl ParameterGroups {
    /// Partitions trainable parameters by a name predicate. The input must
    /// already exclude frozen parameters; the split is deterministic for a
    /// given model and predicate.
    pub fn split(
        named: Vec<(String, Var)>,
        weight_decay: f64,
        decay_eligible: impl Fn(&str) -> bool,
    ) -> Self {
        let mut decay = Vec::new();
        let mut no_decay = Vec::new();
        for (name, var) in named {
            if decay_eligible(&name) {
                decay.push((name, var));
            } else {
                no_decay.push((name, var));
            }
        }
        Self {
            decay: ParameterGroup {
                params: decay,
                weight_decay,
            },
            no_decay: ParameterGroup {
                params: no_decay,
                weight_decay: 0.0,
            },
        }
    }

    /// Flat tensor list over both groups, used for gradient clipping.
    pub fn flat_tensors(&self) -> Vec<Tensor> {
        self.decay
            .params
            .iter()
            .chain(self.no_decay.params.iter())
            .map(|(_, var)| var.as_tensor().clone())
            .collect()
    }

    /// Total trainable element count, for the startup banner.
    pub fn trainable_element_count(&self) -> usize {
        self.decay
            .params
            .iter()
            .chain(self.no_decay.params.iter())
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.decay.params.is_empty() && self.no_decay.params.is_empty()
    }
}

/// Conventional decay eligibility: biases and normalization-layer parameters
/// stay undecayed.
pub fn default_decay_predicate(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !(lower.ends_with("bias") || lower.contains("norm") || lower.contains("ln_"))
}

/// Optimizer contract the loop consumes: grouped construction, stepping over
/// a gradient store, and state (de)serialization for checkpoints.
pub trait Optimizer: Send {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainError>;

    fn zero_grad(&self, grads: &mut GradStore);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state(&self) -> Result<OptimizerState, TrainError>;

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainError>;
}

/// Registry: configuration enum to concrete optimizer, resolved once at loop
/// start.
pub fn build_optimizer(
    groups: ParameterGroups,
    config: &OptimizerConfig,
) -> Result<Box<dyn Optimizer>, TrainError> {
    match config.algorithm {
        OptimizerKind::AdamW => Ok(Box::new(GroupedAdamW::new(groups, config)?)),
    }
}

/// Clips gradients of `params` to a maximum global L2 norm, in place.
/// Returns the pre-clip norm.
pub fn clip_grad_norm(
    params: &[Tensor],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64, TrainError> {
    let mut sum_squares = 0.0f64;
    for tensor in params {
        if let Some(grad) = grads.get(tensor) {
            let sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()? as f64;
            sum_squares += sq;
        }
    }

    let total_norm = sum_squares.sqrt();
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + EPS);
        for tensor in params {
            if let Some(grad) = grads.remove(tensor) {
                let clipped = grad.affine(clip_coef, 0.0)?;
                grads.insert(tensor, clipped);
            }
        }
    }

    Ok(total_norm)
}

/// AdamW over decay/no-decay parameter groups. Moment buffers stay in f32;
/// reduced-precision parameters get fp32 master copies so repeated updates do
/// not lose low-order bits.
pub struct GroupedAdamW {
    params: Vec<ParameterSlot>,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: usize,
}

struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    weight_decay: f64,
}

impl GroupedAdamW {
    pub fn new(groups: ParameterGroups, config: &OptimizerConfig) -> Result<Self, TrainError> {
        if groups.is_empty() {
            return Err(TrainError::config(
                "optimizer requires at least one trainable parameter",
            ));
        }

        let mut params = Vec::new();
        for group in [groups.decay, groups.no_decay] {
            let weight_decay = group.weight_decay;
            for (name, var) in group.params {
                params.push(ParameterSlot::new(name, var, weight_decay)?);
            }
        }

        Ok(Self {
            params,
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            step: 0,
        })
    }
}

impl ParameterSlot {
    fn new(name: String, var: Var, weight_decay: f64) -> Result<Self, TrainError> {
        let tensor = var.as_tensor();
        if !tensor.dtype().is_float() {
            return Err(TrainError::config(format!(
                "optimizer received non-floating parameter '{}'",
                name
            )));
        }
        let device = tensor.device();
        let shape = tensor.dims().to_vec();
        let dtype = tensor.dtype();

        let first_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;
        let second_moment = Tensor::zeros(shape.as_slice(), DType::F32, device)?;

        let master = if dtype != DType::F32 {
            let fp32 = tensor.to_dtype(DType::F32)?;
            Some(Var::from_tensor(&fp32)?)
        } else {
            None
        };

        Ok(Self {
            name,
            param: var,
            dtype,
            master,
            first_moment,
            second_moment,
            weight_decay,
        })
    }
}

impl Optimizer for GroupedAdamW {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainError> {
        self.step += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for slot in &mut self.params {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad.to_dtype(DType::F32)?,
                None => continue,
            };

            let new_m = slot
                .first_moment
                .affine(self.beta1, 0.0)?
                .add(&grad.affine(1.0 - self.beta1, 0.0)?)?;
            let new_v = slot
                .second_moment
                .affine(self.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let v_hat = new_v.affine(scale_v, 0.0)?;
            let denom = v_hat.sqrt()?.affine(1.0, self.epsilon)?;
            let update = m_hat.div(&denom)?.affine(self.learning_rate, 0.0)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot.param.as_tensor().clone(),
            };

            let decayed = if slot.weight_decay != 0.0 {
                base.affine(1.0 - self.learning_rate * slot.weight_decay, 0.0)?
            } else {
                base
            };

            let next = decayed.sub(&update)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next)?;
                slot.param.set(&next.to_dtype(slot.dtype)?)?;
            } else {
                slot.param.set(&next)?;
            }

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state(&self) -> Result<OptimizerState, TrainError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel: usize = shape.iter().product();
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                master,
                weight_decay: slot.weight_decay,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let record = by_name.remove(&slot.name).ok_or_else(|| {
                TrainError::state(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != record.shape {
                return Err(TrainError::state(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected: usize = dims.iter().product();
            if record.first_moment.len() != expected
                || record.second_moment.len() != expected
                || record.master.as_ref().is_some_and(|m| m.len() != expected)
            {
                return Err(TrainError::state(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment =
                Tensor::from_vec(record.first_moment, dims.as_slice(), &device)?;
            slot.second_moment =
                Tensor::from_vec(record.second_moment, dims.as_slice(), &device)?;
            slot.weight_decay = record.weight_decay;

            match (&slot.master, record.master) {
                (Some(master), Some(values)) => {
                    let tensor = Tensor::from_vec(values, dims.as_slice(), &device)?;
                    master.set(&tensor)?;
                    slot.param.set(&tensor.to_dtype(slot.dtype)?)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainError::state(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )));
                }
                (None, Some(_)) => {
                    return Err(TrainError::state(format!(
                        "optimizer state carries master weights for '{}' but the parameter is full precision",
                        slot.name
                    )));
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainError::state(
                "optimizer state has parameters not present in the model",
            ));
        }

        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainError> {
    let flat = tensor.flatten_all()?.to_vec1::<f32>()?;
    if flat.len() != expected {
        return Err(TrainError::state(
            "unexpected element count during optimizer serialization",
        ));
    }
    Ok(flat)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
    pub weight_decay: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn named_var(name: &str, data: &[f32]) -> (String, Var) {
        let tensor = Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap();
        (name.to_string(), Var::from_tensor(&tensor).unwrap())
    }

    // Gradient stores only come out of `backward`, so build one from a dummy
    // pass and overwrite the gradient of interest.
    fn grads_for(var: &Var, grad: &[f32]) -> GradStore {
        let loss = var.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        grads.insert(
            var.as_tensor(),
            Tensor::from_slice(grad, (grad.len(),), &Device::Cpu).unwrap(),
        );
        grads
    }

    fn adamw_config(weight_decay: f64) -> OptimizerConfig {
        OptimizerConfig {
            weight_decay,
            learning_rate: 0.1,
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn split_excludes_bias_and_norm_from_decay() {
        let named = vec![
            named_var("blocks.0.attn.weight", &[1.0]),
            named_var("blocks.0.attn.bias", &[1.0]),
            named_var("blocks.0.norm.weight", &[1.0]),
        ];
        let groups = ParameterGroups::split(named, 0.1, default_decay_predicate);
        assert_eq!(groups.decay.params.len(), 1);
        assert_eq!(groups.no_decay.params.len(), 2);
        assert_eq!(groups.no_decay.weight_decay, 0.0);
        assert_eq!(groups.trainable_element_count(), 3);
        assert_eq!(groups.flat_tensors().len(), 3);
    }

    #[test]
    fn clip_reduces_large_gradients() {
        let (_, var) = named_var("w", &[3.0, 4.0]);
        let params = vec![var.as_tensor().clone()];
        let mut grads = grads_for(&var, &[3.0, 4.0]);

        let norm = clip_grad_norm(&params, &mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);

        let clipped = grads.get(var.as_tensor()).unwrap();
        let values = clipped.to_vec1::<f32>().unwrap();
        let new_norm = (values[0] * values[0] + values[1] * values[1]).sqrt();
        assert!((new_norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let (_, var) = named_var("w", &[1.0]);
        let params = vec![var.as_tensor().clone()];
        let mut grads = grads_for(&var, &[0.5]);
        clip_grad_norm(&params, &mut grads, 1.0).unwrap();
        let values = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![0.5]);
    }

    #[test]
    fn adamw_moves_parameters_against_gradient() {
        let (name, var) = named_var("w", &[1.0, 1.0]);
        let tensor = var.as_tensor().clone();
        let mut grads = grads_for(&var, &[1.0, -1.0]);
        let groups = ParameterGroups::split(vec![(name, var)], 0.0, |_| true);
        let mut optimizer = GroupedAdamW::new(groups, &adamw_config(0.0)).unwrap();

        optimizer.step(&mut grads).unwrap();

        let updated = tensor.to_vec1::<f32>().unwrap();
        assert!(updated[0] < 1.0);
        assert!(updated[1] > 1.0);
    }

    #[test]
    fn state_round_trip_restores_moments() {
        let (name, var) = named_var("w", &[1.0]);
        let mut grads = grads_for(&var, &[0.7]);
        let groups = ParameterGroups::split(vec![(name.clone(), var)], 0.01, |_| true);
        let mut optimizer = GroupedAdamW::new(groups, &adamw_config(0.01)).unwrap();

        optimizer.step(&mut grads).unwrap();
        let state = optimizer.state().unwrap();
        assert_eq!(state.step, 1);

        let (name2, var2) = named_var("w", &[1.0]);
        let groups2 = ParameterGroups::split(vec![(name2, var2)], 0.01, |_| true);
        let mut restored = GroupedAdamW::new(groups2, &adamw_config(0.01)).unwrap();
        restored.load_state(state.clone()).unwrap();
        let state2 = restored.state().unwrap();
        assert_eq!(state2.step, state.step);
        assert_eq!(
            state2.parameters[0].first_moment,
            state.parameters[0].first_moment
        );
    }

    #[test]
    fn load_state_rejects_unknown_parameter() {
        let (name, var) = named_var("w", &[1.0]);
        let groups = ParameterGroups::split(vec![(name, var)], 0.0, |_| true);
        let mut optimizer = GroupedAdamW::new(groups, &adamw_config(0.0)).unwrap();

        let state = OptimizerState {
            step: 3,
            parameters: vec![ParameterState {
                name: "other".to_string(),
                shape: vec![1],
                first_moment: vec![0.0],
                second_moment: vec![0.0],
                master: None,
                weight_decay: 0.0,
            }],
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
