use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Immutable snapshot of everything the loop needs to know before it starts.
///
/// Loaded once from TOML or JSON, validated, and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainError::config(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        Self::from_path(path)
    }

    /// Collects every violation instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), TrainError> {
        let mut errors = Vec::new();

        if self.data.per_device_batch_size == 0 {
            errors.push("data.per_device_batch_size must be greater than 0".to_string());
        }

        if self.data.accumulation_steps == 0 {
            errors.push("data.accumulation_steps must be greater than 0".to_string());
        }

        if self.runtime.world_size != 1 {
            errors.push(format!(
                "runtime.world_size must be 1; multi-device training is unsupported (got {})",
                self.runtime.world_size
            ));
        }

        match (self.runtime.max_steps, self.runtime.num_train_epochs) {
            (Some(0), _) => errors.push("runtime.max_steps must be greater than 0".to_string()),
            (_, Some(epochs)) if epochs <= 0.0 => {
                errors.push("runtime.num_train_epochs must be greater than 0".to_string());
            }
            (Some(_), Some(_)) => errors.push(
                "exactly one of runtime.max_steps and runtime.num_train_epochs may be set"
                    .to_string(),
            ),
            (None, None) => errors.push(
                "one of runtime.max_steps or runtime.num_train_epochs is required".to_string(),
            ),
            _ => {}
        }

        if self.runtime.logging_steps == 0 {
            errors.push("runtime.logging_steps must be greater than 0".to_string());
        }

        if self.runtime.output_dir.as_os_str().is_empty() {
            errors.push("runtime.output_dir must not be empty".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.max_grad_norm <= 0.0 {
            errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
        }

        let save = &self.runtime.save;
        if let Some(0) = save.every_n_steps {
            errors.push("runtime.save.every_n_steps must be greater than 0".to_string());
        }
        if let Some(fraction) = save.at_fraction {
            if !(0.0 < fraction && fraction <= 1.0) {
                errors.push("runtime.save.at_fraction must be in (0, 1]".to_string());
            }
        }
        if save.strategy == SaveStrategy::Steps
            && save.every_n_steps.is_none()
            && save.at_fraction.is_none()
        {
            errors.push(
                "runtime.save with the steps strategy requires `every_n_steps` and/or `at_fraction`"
                    .to_string(),
            );
        }
        if let Some(0) = save.max_keep {
            errors.push("runtime.save.max_keep must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainError::Validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        if self.runtime.output_dir.is_relative() {
            self.runtime.output_dir = base.join(&self.runtime.output_dir);
        }
        if let Some(samples) = self.data.samples.as_mut() {
            if samples.is_relative() {
                *samples = base.join(&*samples);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Optional path to a JSONL file of pre-collated samples, consumed by the
    /// preflight binary. The library takes samples through `MicroBatchSource`.
    #[serde(default)]
    pub samples: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub per_device_batch_size: usize,
    #[serde(default = "default_accumulation_steps")]
    pub accumulation_steps: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            samples: None,
            per_device_batch_size: default_batch_size(),
            accumulation_steps: default_accumulation_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerKind,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerKind::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
        }
    }
}

/// Optimizer selection, resolved through the registry once at loop start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    AdamW,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::AdamW
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: ScheduleKind,
    #[serde(default)]
    pub warmup_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: ScheduleKind::default(),
            warmup_steps: 0,
        }
    }
}

/// Learning-rate schedule selection, resolved through the registry once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Constant,
    Linear,
    Cosine,
}

impl Default for ScheduleKind {
    fn default() -> Self {
        Self::Linear
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    /// Exactly one of `max_steps` / `num_train_epochs` drives the run length.
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub num_train_epochs: Option<f64>,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    /// Gates the stdout progress stream and the progress bar.
    #[serde(default = "default_enable_progress")]
    pub enable_progress: bool,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub save: SaveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    #[serde(default)]
    pub strategy: SaveStrategy,
    /// Save whenever the global step is a multiple of this count.
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    /// Save once more at `round(max_steps * at_fraction)`. A separate field
    /// from `every_n_steps`; the two triggers compose.
    #[serde(default)]
    pub at_fraction: Option<f64>,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            strategy: SaveStrategy::default(),
            every_n_steps: None,
            at_fraction: None,
            max_keep: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStrategy {
    Steps,
    Epoch,
}

impl Default for SaveStrategy {
    fn default() -> Self {
        Self::Steps
    }
}

fn default_batch_size() -> usize {
    8
}

fn default_accumulation_steps() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    42
}

fn default_world_size() -> usize {
    1
}

fn default_logging_steps() -> usize {
    10
}

fn default_enable_progress() -> bool {
    true
}

/// Error taxonomy for the whole crate.
///
/// `Config`/`Validation` fire before any state mutation, `CheckpointNotFound`
/// only when resume was explicitly requested, `Compute` for device or numeric
/// failures during forward/backward, `Io` for checkpoint traffic, `State` for
/// checkpoint content that fails validation.
#[derive(Debug)]
pub enum TrainError {
    Config(String),
    Validation(Vec<String>),
    CheckpointNotFound(String),
    Compute(String),
    Io(std::io::Error),
    State(String),
}

impl TrainError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub fn checkpoint_not_found(message: impl Into<String>) -> Self {
        Self::CheckpointNotFound(message.into())
    }
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            TrainError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainError::CheckpointNotFound(msg) => write!(f, "no checkpoint found: {}", msg),
            TrainError::Compute(msg) => write!(f, "training failed: {}", msg),
            TrainError::Io(err) => write!(f, "checkpoint I/O failed: {}", err),
            TrainError::State(msg) => write!(f, "checkpoint state rejected: {}", msg),
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainError {
    fn from(value: std::io::Error) -> Self {
        TrainError::Io(value)
    }
}

impl From<toml::de::Error> for TrainError {
    fn from(value: toml::de::Error) -> Self {
        TrainError::Config(value.to_string())
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(value: serde_json::Error) -> Self {
        TrainError::Config(value.to_string())
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(value: candle_core::Error) -> Self {
        TrainError::Compute(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> TrainingConfig {
        TrainingConfig {
            data: DataConfig::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            runtime: RuntimeConfig {
                seed: 42,
                world_size: 1,
                max_steps: Some(10),
                num_train_epochs: None,
                logging_steps: 10,
                enable_progress: false,
                output_dir: PathBuf::from("out"),
                save: SaveConfig {
                    strategy: SaveStrategy::Steps,
                    every_n_steps: Some(5),
                    at_fraction: None,
                    max_keep: None,
                },
            },
        }
    }

    #[test]
    fn accepts_minimal_config() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn rejects_multi_device() {
        let mut config = minimal();
        config.runtime.world_size = 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TrainError::Validation(_)));
    }

    #[test]
    fn rejects_ambiguous_run_length() {
        let mut config = minimal();
        config.runtime.num_train_epochs = Some(3.0);
        assert!(config.validate().is_err());

        config.runtime.max_steps = None;
        config.runtime.num_train_epochs = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_steps_strategy_without_trigger() {
        let mut config = minimal();
        config.runtime.save.every_n_steps = None;
        config.runtime.save.at_fraction = None;
        assert!(config.validate().is_err());

        config.runtime.save.at_fraction = Some(0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn collects_multiple_violations() {
        let mut config = minimal();
        config.data.accumulation_steps = 0;
        config.optimizer.learning_rate = 0.0;
        match config.validate().unwrap_err() {
            TrainError::Validation(messages) => assert!(messages.len() >= 2),
            other => panic!("expected validation error, got {other}"),
        }
    }
}
