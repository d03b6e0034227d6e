use candle_core::{backprop::GradStore, DType, Device, Tensor};
use indicatif::ProgressBar;

use crate::{
    checkpoint::{self, ResumeFrom, SaveRequest, TrainerState},
    config::{SaveStrategy, TrainError, TrainingConfig},
    data::{BlockingLoader, MicroBatch, MicroBatchSource},
    logging::{Logger, RunBanner},
    metrics::{RunStats, RunTimer},
    model::{set_training_mode, TrainableModel},
    optimizer::{
        build_optimizer, clip_grad_norm, default_decay_predicate, Optimizer, ParameterGroups,
    },
    planner::{StepPlan, TrainHorizon},
    precision::PrecisionContext,
    scheduler::{build_scheduler, LrScheduler},
};

/// The loop orchestrator. Owns the model, the data source, and every piece of
/// device state for the duration of `run`; nothing else may mutate them.
///
/// A run moves from construction through `run` to either a returned
/// [`RunStats`] or a fatal error; there is no pause state. Interruption is
/// handled by restarting the process and resuming from the last checkpoint.
pub struct Trainer<M, S>
where
    M: TrainableModel,
    S: MicroBatchSource,
{
    config: TrainingConfig,
    device: Device,
    model: M,
    source: BlockingLoader<S>,
    logger: Logger,
}

impl<M, S> Trainer<M, S>
where
    M: TrainableModel,
    S: MicroBatchSource,
{
    pub fn new(
        config: TrainingConfig,
        model: M,
        source: S,
        device: Device,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let logger = Logger::new(config.runtime.enable_progress);
        Ok(Self {
            config,
            device,
            model,
            source: BlockingLoader::new(source),
            logger,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Drives the whole run: resume resolution, collaborator construction,
    /// epoch/window iteration, checkpoint cadence, and final statistics.
    ///
    /// Any failure inside forward/backward, device transfer, or data loading
    /// is fatal and propagates; a silently skipped batch would corrupt the
    /// accumulation denominator. Partial checkpoints on disk stay valid for a
    /// later resume.
    pub fn run(&mut self, resume: ResumeFrom) -> Result<RunStats, TrainError> {
        let horizon = TrainHorizon::from_config(&self.config)?;
        let plan = StepPlan::resolve(
            self.config.data.per_device_batch_size,
            self.config.data.accumulation_steps,
            self.config.runtime.world_size,
            self.source.num_samples(),
            horizon,
        )?;

        let loaded = match &resume {
            ResumeFrom::Fresh => None,
            ResumeFrom::Latest => {
                let output_dir = &self.config.runtime.output_dir;
                let directory = checkpoint::latest_checkpoint(output_dir)?.ok_or_else(|| {
                    TrainError::checkpoint_not_found(format!(
                        "no checkpoint under {}",
                        output_dir.display()
                    ))
                })?;
                Some(checkpoint::load_checkpoint(&directory)?)
            }
            ResumeFrom::Path(path) => {
                if !path.is_dir() {
                    return Err(TrainError::checkpoint_not_found(format!(
                        "{} is not a checkpoint directory",
                        path.display()
                    )));
                }
                Some(checkpoint::load_checkpoint(path)?)
            }
        };

        let named = self.model.trainable_parameters();
        if named.is_empty() {
            return Err(TrainError::config("model has no trainable parameters"));
        }
        let groups = ParameterGroups::split(
            named,
            self.config.optimizer.weight_decay,
            default_decay_predicate,
        );
        let trainable = groups.flat_tensors();
        let trainable_parameters = groups.trainable_element_count();

        let mut optimizer = build_optimizer(groups, &self.config.optimizer)?;
        let mut scheduler = build_scheduler(
            self.config.scheduler.strategy,
            self.config.optimizer.learning_rate,
            self.config.scheduler.warmup_steps,
            plan.max_steps,
        )?;
        let mut precision = PrecisionContext::for_parameter_dtype(self.model.parameter_dtype());
        optimizer.set_learning_rate(scheduler.learning_rate());

        let mut state = TrainerState::fresh();
        if let Some(loaded) = loaded {
            checkpoint::apply_model_weights(&self.model, &loaded.weights_path)?;
            optimizer.load_state(loaded.optimizer_state)?;
            scheduler.load_snapshot(&loaded.scheduler_state)?;
            optimizer.set_learning_rate(scheduler.learning_rate());
            if let Some(scaler_state) = &loaded.scaler_state {
                precision.load_scaler_state(scaler_state);
            }
            if let Some(trainer_state) = loaded.trainer_state {
                state = trainer_state;
            }
            self.logger.info(&format!(
                "resumed from {} at step {}",
                loaded.directory.display(),
                state.global_step
            ));
        }

        set_training_mode(&mut self.model, true);

        self.logger.banner(&RunBanner {
            num_examples: self.source.num_samples(),
            num_epochs: plan.epochs,
            per_device_batch_size: self.config.data.per_device_batch_size,
            accumulation_steps: self.config.data.accumulation_steps,
            total_batch_size: plan.total_batch_size,
            max_steps: plan.max_steps,
            trainable_parameters,
        });

        let progress = if self.config.runtime.enable_progress {
            ProgressBar::new(plan.max_steps as u64)
        } else {
            ProgressBar::hidden()
        };
        progress.set_position(state.global_step.min(plan.max_steps) as u64);

        let timer = RunTimer::start();
        let resume_point = plan.resume_point(state.global_step);
        let accumulation_steps = self.config.data.accumulation_steps;
        let max_grad_norm = self.config.optimizer.max_grad_norm;
        let save = self.config.runtime.save.clone();
        let fraction_milestone = save
            .at_fraction
            .map(|fraction| (plan.max_steps as f64 * fraction).round() as usize);

        let mut accumulated_loss = 0f64;
        let mut last_logged = None;
        let mut epochs_completed = resume_point.epoch;

        'epochs: for epoch in resume_point.epoch..plan.epochs {
            if state.global_step >= plan.max_steps {
                break;
            }
            state.epoch = epoch;

            // Identical data order on replay, independent of the resume point.
            self.source
                .begin_epoch(self.config.runtime.seed.wrapping_add(epoch as u64))?;
            let start_window = if epoch == resume_point.epoch {
                resume_point.step_in_epoch
            } else {
                0
            };
            for window in 0..start_window {
                for _ in 0..plan.window_size(window, accumulation_steps) {
                    self.next_batch()?;
                }
            }

            let mut stopped = false;
            let mut epoch_finished = true;
            for window in start_window..plan.max_iterations_per_epoch {
                // The whole window is materialized before any forward pass so
                // the loss denominator can span every micro-batch in it.
                let n_batches = plan.window_size(window, accumulation_steps);
                let mut batches = Vec::with_capacity(n_batches);
                for _ in 0..n_batches {
                    batches.push(self.next_batch()?.to_device(&self.device)?);
                }

                let mut normalization_count = 0usize;
                for batch in &batches {
                    normalization_count += batch.target_token_count()?;
                }

                let mut window_grads: Option<GradStore> = None;
                for batch in &batches {
                    let loss = precision
                        .forward_scope(|_| self.model.forward(batch, normalization_count))?;
                    accumulated_loss +=
                        loss.detach().to_dtype(DType::F32)?.to_vec0::<f32>()? as f64;
                    let micro_grads = precision.backward(&loss)?;
                    window_grads = match window_grads {
                        Some(mut existing) => {
                            merge_grad_stores(&trainable, &mut existing, micro_grads)?;
                            Some(existing)
                        }
                        None => Some(micro_grads),
                    };
                }
                let mut grads = window_grads.ok_or_else(|| {
                    TrainError::compute("accumulation window produced no gradients")
                })?;

                precision.optimizer_step(
                    optimizer.as_mut(),
                    clip_grad_norm,
                    &trainable,
                    max_grad_norm,
                    &mut grads,
                )?;
                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
                optimizer.zero_grad(&mut grads);
                state.global_step += 1;
                progress.inc(1);

                if state.global_step % self.config.runtime.logging_steps == 0 {
                    self.logger.log_step(state.global_step, accumulated_loss);
                    last_logged = Some(accumulated_loss);
                    accumulated_loss = 0.0;
                }

                if save.strategy == SaveStrategy::Steps {
                    let interval_hit = save
                        .every_n_steps
                        .is_some_and(|n| state.global_step % n == 0);
                    let fraction_hit = fraction_milestone == Some(state.global_step);
                    if interval_hit || fraction_hit {
                        self.write_checkpoint(
                            optimizer.as_ref(),
                            scheduler.as_ref(),
                            &precision,
                            &state,
                        )?;
                    }
                }

                if state.global_step == plan.max_steps {
                    stopped = true;
                    epoch_finished = window + 1 == plan.max_iterations_per_epoch;
                    break;
                }
            }

            if epoch_finished {
                epochs_completed = epoch + 1;
            }
            if save.strategy == SaveStrategy::Epoch {
                self.write_checkpoint(optimizer.as_ref(), scheduler.as_ref(), &precision, &state)?;
            }
            if stopped {
                break 'epochs;
            }
        }

        set_training_mode(&mut self.model, false);
        progress.finish_and_clear();

        Ok(RunStats {
            train_runtime: timer.elapsed_secs(),
            global_step: state.global_step,
            epochs_completed,
            final_loss: last_logged,
        })
    }

    fn next_batch(&mut self) -> Result<MicroBatch, TrainError> {
        self.source.next_micro_batch()?.ok_or_else(|| {
            TrainError::compute("data source exhausted before the planned window count")
        })
    }

    fn write_checkpoint(
        &self,
        optimizer: &dyn Optimizer,
        scheduler: &dyn LrScheduler,
        precision: &PrecisionContext,
        state: &TrainerState,
    ) -> Result<(), TrainError> {
        let directory = checkpoint::save_checkpoint(SaveRequest {
            output_dir: &self.config.runtime.output_dir,
            model: &self.model,
            optimizer,
            scheduler,
            scaler_state: precision.scaler_state(),
            trainer_state: state.clone(),
            max_keep: self.config.runtime.save.max_keep,
        })?;
        self.logger.info(&format!(
            "checkpoint saved at step {} -> {}",
            state.global_step,
            directory.display()
        ));
        Ok(())
    }
}

/// Adds a micro-batch's gradients into the window accumulator, tensor by
/// tensor over the trainable list.
fn merge_grad_stores(
    params: &[Tensor],
    accum: &mut GradStore,
    mut fresh: GradStore,
) -> Result<(), TrainError> {
    for tensor in params {
        if let Some(grad) = fresh.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}
