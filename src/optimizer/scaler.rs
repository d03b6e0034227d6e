use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::TrainError;

/// Dynamic loss-scaling policy for fp16 training: shrink on overflow, grow
/// after a run of clean windows, clamp to a sane range.
#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Serialized scaler state carried inside checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossScalerState {
    pub scale: f32,
    pub stable_windows: usize,
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
    stable_windows: usize,
    config: LossScaleConfig,
}

impl LossScaler {
    pub fn new() -> Self {
        Self::with_config(LossScaleConfig::default())
    }

    pub fn with_config(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);
        Self {
            scale: config.initial_scale,
            stable_windows: 0,
            config,
        }
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale
    }

    /// Inflates the loss before backward so small gradients survive fp16.
    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainError> {
        Ok(tensor.affine(self.scale as f64, 0.0)?)
    }

    /// Removes the inflation from a gradient before clipping.
    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainError> {
        Ok(tensor.affine(1.0 / self.scale as f64, 0.0)?)
    }

    /// Standard dynamic policy: backoff immediately on overflow, grow after
    /// `growth_interval` consecutive clean windows.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale = (self.scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_windows = 0;
        } else {
            self.stable_windows += 1;
            if self.stable_windows >= self.config.growth_interval {
                self.scale = (self.scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_windows = 0;
            }
        }
    }

    pub fn state(&self) -> LossScalerState {
        LossScalerState {
            scale: self.scale,
            stable_windows: self.stable_windows,
        }
    }

    pub fn load_state(&mut self, state: &LossScalerState) {
        self.scale = state
            .scale
            .clamp(self.config.min_scale, self.config.max_scale);
        self.stable_windows = state.stable_windows;
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new()
    }
}

/// True when a tensor contains any non-finite value.
pub fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}
