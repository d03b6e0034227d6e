use crate::config::{TrainError, TrainingConfig};

/// How long the run is: an explicit optimizer-step budget or a (possibly
/// fractional) epoch target. Exactly one is configured.
#[derive(Debug, Clone, Copy)]
pub enum TrainHorizon {
    Steps(usize),
    Epochs(f64),
}

impl TrainHorizon {
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainError> {
        match (config.runtime.max_steps, config.runtime.num_train_epochs) {
            (Some(steps), None) if steps > 0 => Ok(Self::Steps(steps)),
            (None, Some(epochs)) if epochs > 0.0 => Ok(Self::Epochs(epochs)),
            _ => Err(TrainError::config(
                "exactly one of max_steps and num_train_epochs must be set and positive",
            )),
        }
    }
}

/// Static shape of the whole run, derived once before the loop starts.
///
/// Pure arithmetic over the configuration and the dataset size; no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    pub total_batch_size: usize,
    pub updates_per_epoch: usize,
    pub max_steps: usize,
    pub epochs: usize,
    /// Accumulation windows the inner loop iterates per epoch.
    pub max_iterations_per_epoch: usize,
    /// Micro-batch count of the final window of each epoch. Never zero: a
    /// dataset divisible by `accumulation_steps` keeps full final windows.
    pub leftover_batches: usize,
}

/// Where a resumed run continues: the epoch to re-enter and the window offset
/// within it. Windows before the offset are replayed by the data source but
/// never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub epoch: usize,
    pub step_in_epoch: usize,
}

impl StepPlan {
    pub fn resolve(
        per_device_batch_size: usize,
        accumulation_steps: usize,
        world_size: usize,
        dataset_size: usize,
        horizon: TrainHorizon,
    ) -> Result<Self, TrainError> {
        if world_size != 1 {
            return Err(TrainError::config(format!(
                "multi-device training is unsupported (world_size = {})",
                world_size
            )));
        }
        if per_device_batch_size == 0 || accumulation_steps == 0 {
            return Err(TrainError::config(
                "batch size and accumulation steps must be greater than 0",
            ));
        }
        if dataset_size == 0 {
            return Err(TrainError::config("dataset contains no samples"));
        }

        let total_batch_size = per_device_batch_size * accumulation_steps;
        let updates_per_epoch = (dataset_size / accumulation_steps).max(1);

        let (max_steps, epochs) = match horizon {
            TrainHorizon::Steps(max_steps) => {
                let epochs = max_steps / updates_per_epoch
                    + usize::from(max_steps % updates_per_epoch > 0);
                (max_steps, epochs)
            }
            TrainHorizon::Epochs(target) => {
                let max_steps = (target * updates_per_epoch as f64).ceil() as usize;
                (max_steps, target.ceil() as usize)
            }
        };

        let max_iterations_per_epoch = dataset_size.div_ceil(accumulation_steps);
        let leftover = dataset_size % accumulation_steps;
        let leftover_batches = if leftover == 0 {
            accumulation_steps
        } else {
            leftover
        };

        Ok(Self {
            total_batch_size,
            updates_per_epoch,
            max_steps,
            epochs,
            max_iterations_per_epoch,
            leftover_batches,
        })
    }

    /// Micro-batches in window `index` of an epoch.
    pub fn window_size(&self, index: usize, accumulation_steps: usize) -> usize {
        if index + 1 == self.max_iterations_per_epoch {
            self.leftover_batches
        } else {
            accumulation_steps
        }
    }

    /// Maps a persisted global step back onto (epoch, window offset).
    pub fn resume_point(&self, saved_global_step: usize) -> ResumePoint {
        let epoch = saved_global_step / self.max_iterations_per_epoch;
        ResumePoint {
            epoch,
            step_in_epoch: saved_global_step - self.max_iterations_per_epoch * epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_steps_from_epoch_target() {
        let plan = StepPlan::resolve(4, 8, 1, 100, TrainHorizon::Epochs(3.0)).unwrap();
        assert_eq!(plan.updates_per_epoch, 12);
        assert_eq!(plan.max_steps, 36);
        assert_eq!(plan.epochs, 3);
        assert_eq!(plan.total_batch_size, 32);
        assert_eq!(plan.max_iterations_per_epoch, 13);
        assert_eq!(plan.leftover_batches, 4);
    }

    #[test]
    fn derives_epochs_from_step_budget() {
        let plan = StepPlan::resolve(2, 4, 1, 40, TrainHorizon::Steps(25)).unwrap();
        assert_eq!(plan.updates_per_epoch, 10);
        assert_eq!(plan.epochs, 3);
        assert_eq!(plan.max_steps, 25);
    }

    #[test]
    fn divisible_dataset_keeps_full_final_window() {
        let plan = StepPlan::resolve(1, 4, 1, 16, TrainHorizon::Epochs(1.0)).unwrap();
        assert_eq!(plan.max_iterations_per_epoch, 4);
        assert_eq!(plan.leftover_batches, 4);
        assert_eq!(plan.window_size(3, 4), 4);
    }

    #[test]
    fn short_final_window() {
        let plan = StepPlan::resolve(1, 8, 1, 100, TrainHorizon::Epochs(1.0)).unwrap();
        assert_eq!(plan.window_size(0, 8), 8);
        assert_eq!(plan.window_size(12, 8), 4);
    }

    #[test]
    fn resume_point_splits_global_step() {
        let plan = StepPlan::resolve(1, 8, 1, 100, TrainHorizon::Epochs(3.0)).unwrap();
        assert_eq!(
            plan.resume_point(0),
            ResumePoint {
                epoch: 0,
                step_in_epoch: 0
            }
        );
        assert_eq!(
            plan.resume_point(13),
            ResumePoint {
                epoch: 1,
                step_in_epoch: 0
            }
        );
        assert_eq!(
            plan.resume_point(17),
            ResumePoint {
                epoch: 1,
                step_in_epoch: 4
            }
        );
    }

    #[test]
    fn rejects_multi_device() {
        let err = StepPlan::resolve(1, 1, 2, 10, TrainHorizon::Steps(1)).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn tiny_dataset_still_plans_one_update_per_epoch() {
        let plan = StepPlan::resolve(1, 8, 1, 3, TrainHorizon::Epochs(2.0)).unwrap();
        assert_eq!(plan.updates_per_epoch, 1);
        assert_eq!(plan.max_steps, 2);
        assert_eq!(plan.max_iterations_per_epoch, 1);
        assert_eq!(plan.leftover_batches, 3);
    }
}
