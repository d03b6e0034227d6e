pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod planner;
pub mod precision;
pub mod sanity;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{ResumeFrom, TrainerState};
pub use config::{OptimizerKind, SaveStrategy, ScheduleKind, TrainError, TrainingConfig};
pub use data::{BlockingLoader, InMemoryLoader, MicroBatch, MicroBatchSource, Sample, IGNORE_INDEX};
pub use loss::cross_entropy_with_normalizer;
pub use metrics::RunStats;
pub use model::{set_training_mode, TrainableModel};
pub use optimizer::{clip_grad_norm, Optimizer, ParameterGroups};
pub use planner::{ResumePoint, StepPlan, TrainHorizon};
pub use precision::{PrecisionContext, PrecisionMode};
pub use sanity::{scan_labels, ScanReport};
pub use scheduler::LrScheduler;
pub use trainer::Trainer;
