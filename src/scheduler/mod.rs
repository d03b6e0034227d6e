use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::{ScheduleKind, TrainError};

/// Learning-rate schedule contract: one `step` per optimizer step, plus state
/// (de)serialization for checkpoints.
///
/// A freshly built schedule already carries the rate for the first optimizer
/// step; `step` advances past a completed step and returns the rate for the
/// next one.
pub trait LrScheduler: Send {
    fn step(&mut self) -> f64;

    fn learning_rate(&self) -> f64;

    fn snapshot(&self) -> SchedulerState;

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainError>;
}

/// Serialized scheduler state carried inside checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    pub step: usize,
    pub current_lr: f64,
}

/// Registry: configuration enum to concrete schedule, resolved once at loop
/// start.
pub fn build_scheduler(
    kind: ScheduleKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> Result<Box<dyn LrScheduler>, TrainError> {
    if base_lr <= 0.0 {
        return Err(TrainError::config(
            "scheduler requires a base learning rate > 0",
        ));
    }
    if total_steps == 0 {
        return Err(TrainError::config(
            "scheduler requires total_steps greater than zero",
        ));
    }
    if warmup_steps > total_steps {
        return Err(TrainError::config(
            "scheduler warmup_steps cannot exceed total_steps",
        ));
    }

    let mut schedule = WarmupSchedule {
        kind,
        base_lr,
        warmup_steps,
        total_steps,
        step: 0,
        current_lr: 0.0,
    };
    schedule.current_lr = schedule.compute_lr(0);
    Ok(Box::new(schedule))
}

/// Linear warmup into a constant, linearly decaying, or cosine-decaying tail.
struct WarmupSchedule {
    kind: ScheduleKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupSchedule {
    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            return self.base_lr * progress;
        }

        if self.total_steps <= self.warmup_steps {
            return self.base_lr;
        }

        let effective = step.saturating_sub(self.warmup_steps) as f64;
        let denom = (self.total_steps - self.warmup_steps).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);

        match self.kind {
            ScheduleKind::Constant => self.base_lr,
            ScheduleKind::Linear => self.base_lr * (1.0 - progress),
            ScheduleKind::Cosine => self.base_lr * 0.5 * (1.0 + f64::cos(PI * progress)),
        }
    }

    fn kind_tag(&self) -> &'static str {
        match self.kind {
            ScheduleKind::Constant => "constant",
            ScheduleKind::Linear => "linear",
            ScheduleKind::Cosine => "cosine",
        }
    }
}

impl LrScheduler for WarmupSchedule {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: self.kind_tag().to_string(),
            step: self.step,
            current_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainError> {
        if state.kind != self.kind_tag() {
            return Err(TrainError::state(format!(
                "scheduler state kind '{}' does not match configured '{}'",
                state.kind,
                self.kind_tag()
            )));
        }
        self.step = state.step;
        self.current_lr = state.current_lr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_linearly_then_holds_constant() {
        let mut scheduler = build_scheduler(ScheduleKind::Constant, 1.0, 4, 10).unwrap();
        assert!((scheduler.learning_rate() - 0.25).abs() < 1e-9);
        assert!((scheduler.step() - 0.5).abs() < 1e-9);
        assert!((scheduler.step() - 0.75).abs() < 1e-9);
        assert!((scheduler.step() - 1.0).abs() < 1e-9);
        assert!((scheduler.step() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn linear_schedule_decays_to_zero() {
        let mut scheduler = build_scheduler(ScheduleKind::Linear, 1.0, 0, 4).unwrap();
        assert!((scheduler.learning_rate() - 1.0).abs() < 1e-9);
        assert!((scheduler.step() - 0.75).abs() < 1e-9);
        for _ in 0..3 {
            scheduler.step();
        }
        assert!(scheduler.learning_rate() < 1e-9);
    }

    #[test]
    fn cosine_schedule_is_monotone_after_warmup() {
        let mut scheduler = build_scheduler(ScheduleKind::Cosine, 1.0, 2, 10).unwrap();
        let mut previous = f64::INFINITY;
        scheduler.step();
        scheduler.step();
        for _ in 2..10 {
            let lr = scheduler.step();
            assert!(lr <= previous);
            previous = lr;
        }
    }

    #[test]
    fn snapshot_round_trip_resumes_mid_schedule() {
        let mut scheduler = build_scheduler(ScheduleKind::Cosine, 1.0, 2, 10).unwrap();
        for _ in 0..5 {
            scheduler.step();
        }
        let state = scheduler.snapshot();

        let mut resumed = build_scheduler(ScheduleKind::Cosine, 1.0, 2, 10).unwrap();
        resumed.load_snapshot(&state).unwrap();
        assert_eq!(resumed.learning_rate(), scheduler.learning_rate());
        assert_eq!(resumed.step(), scheduler.step());
    }

    #[test]
    fn snapshot_kind_mismatch_is_rejected() {
        let scheduler = build_scheduler(ScheduleKind::Linear, 1.0, 0, 10).unwrap();
        let state = scheduler.snapshot();
        let mut other = build_scheduler(ScheduleKind::Cosine, 1.0, 0, 10).unwrap();
        assert!(other.load_snapshot(&state).is_err());
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(build_scheduler(ScheduleKind::Linear, 0.0, 0, 10).is_err());
        assert!(build_scheduler(ScheduleKind::Linear, 1.0, 11, 10).is_err());
        assert!(build_scheduler(ScheduleKind::Linear, 1.0, 0, 0).is_err());
    }
}
