//! Per-step hyperparameter schedules.
//!
//! Every schedule is materialised once as a vector with one entry per
//! optimisation step (`epochs * steps_per_epoch`) and only read afterwards.

use std::f64::consts::PI;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("step {step} is outside the schedule of length {len}")]
    OutOfRange { step: usize, len: usize },

    #[error("warmup of {warmup_epochs} epochs exceeds the {epochs} scheduled epochs")]
    WarmupTooLong { warmup_epochs: usize, epochs: usize },

    #[error("schedule needs epochs > 0 and steps_per_epoch > 0")]
    Empty,
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

/// Cosine decay from `base` to `final_value` with an optional linear warmup
/// from `warmup_start` to `base`.
///
/// The result has exactly `epochs * steps_per_epoch` entries.
pub fn cosine_schedule(
    base: f64,
    final_value: f64,
    epochs: usize,
    steps_per_epoch: usize,
    warmup_epochs: usize,
    warmup_start: f64,
) -> Result<Vec<f64>> {
    if epochs == 0 || steps_per_epoch == 0 {
        return Err(ScheduleError::Empty);
    }
    if warmup_epochs > epochs {
        return Err(ScheduleError::WarmupTooLong {
            warmup_epochs,
            epochs,
        });
    }

    let total = epochs * steps_per_epoch;
    let warmup_iters = warmup_epochs * steps_per_epoch;
    let mut schedule = Vec::with_capacity(total);

    // Inclusive linspace, so the last warmup step reaches `base`.
    for i in 0..warmup_iters {
        let frac = if warmup_iters > 1 {
            i as f64 / (warmup_iters - 1) as f64
        } else {
            0.0
        };
        schedule.push(warmup_start + (base - warmup_start) * frac);
    }

    let decay_iters = total - warmup_iters;
    for i in 0..decay_iters {
        let progress = i as f64 / decay_iters as f64;
        schedule.push(final_value + 0.5 * (base - final_value) * (1.0 + (PI * progress).cos()));
    }

    debug_assert_eq!(schedule.len(), total);
    Ok(schedule)
}

/// Inputs of the training schedules.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Peak learning rate, already scaled by the global batch size.
    pub base_lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub weight_decay_end: f64,
    pub momentum_teacher: f64,
    /// Final weight of the intermediate-layer loss.
    pub ratio: f64,
    pub epochs: usize,
    pub warmup_epochs: usize,
}

/// Values of every schedule at one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledValues {
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub ratio: f64,
}

/// The four schedules driving a training run.
#[derive(Debug, Clone)]
pub struct Schedules {
    lr: Vec<f64>,
    weight_decay: Vec<f64>,
    momentum: Vec<f64>,
    ratio: Vec<f64>,
}

impl Schedules {
    pub fn new(cfg: &ScheduleConfig, steps_per_epoch: usize) -> Result<Self> {
        let epochs = cfg.epochs;
        Ok(Self {
            lr: cosine_schedule(
                cfg.base_lr,
                cfg.min_lr,
                epochs,
                steps_per_epoch,
                cfg.warmup_epochs,
                0.0,
            )?,
            weight_decay: cosine_schedule(
                cfg.weight_decay,
                cfg.weight_decay_end,
                epochs,
                steps_per_epoch,
                0,
                0.0,
            )?,
            momentum: cosine_schedule(cfg.momentum_teacher, 1.0, epochs, steps_per_epoch, 0, 0.0)?,
            ratio: cosine_schedule(0.0, cfg.ratio, epochs, steps_per_epoch, 0, 0.0)?,
        })
    }

    pub fn len(&self) -> usize {
        self.lr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lr.is_empty()
    }

    pub fn at(&self, step: usize) -> Result<ScheduledValues> {
        let len = self.len();
        if step >= len {
            return Err(ScheduleError::OutOfRange { step, len });
        }
        Ok(ScheduledValues {
            lr: self.lr[step],
            weight_decay: self.weight_decay[step],
            momentum: self.momentum[step],
            ratio: self.ratio[step],
        })
    }

    pub fn lr(&self) -> &[f64] {
        &self.lr
    }

    pub fn momentum(&self) -> &[f64] {
        &self.momentum
    }
}
