//! Training controllers.
//!
//! A [`Learner`] owns the networks of one method and exposes a training step
//! as a sequence of phases:
//!
//! 1. [`Learner::compute_gradients`]: forward both views, build the loss,
//!    backpropagate. [`Learner::accumulate_gradients`] repeats it over
//!    micro-batches and averages.
//! 2. [`Learner::synchronize_gradients`]: average gradients across workers.
//! 3. [`Learner::clip`]: bound the global gradient norm.
//! 4. [`Learner::apply_student_update`]: optimizer step.
//! 5. [`Learner::apply_teacher_update`]: momentum update (no-op without a
//!    teacher).
//! 6. [`Learner::advance`]: move to the next scheduled step.
//!
//! [`Learner::train_accumulated`] composes them in that order and
//! [`Learner::train_step`] is its single-batch form; [`fit`] drives whole
//! epochs and the periodic KNN evaluation.

pub mod config;
mod fit;
mod momentum;
mod simclr;
mod state;

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use thiserror::Error;

use crate::config::ConfigError;
use crate::data::{DataError, TwoViewBatch};
use crate::distributed::DistributedError;
use crate::head::EmbeddingNet;
use crate::knn::KnnError;
use crate::loss::LossError;
use crate::metrics::MetricsError;
use crate::models::ModelError;
use crate::momentum::MomentumError;
use crate::optim::OptimError;
use crate::schedule::{ScheduleError, ScheduledValues};

pub use config::{Method, TrainerConfig, LR_REFERENCE_BATCH};
pub use fit::{build_learner, evaluate_knn, fit, FitData};
pub use momentum::MomentumLearner;
pub use simclr::SimClrLearner;
pub use state::OptimizationState;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("unknown method: {0} (expected momentum or simclr)")]
    UnknownMethod(String),

    #[error("loss is not finite at step {step}: {value}")]
    NonFiniteLoss { step: usize, value: f32 },

    #[error("training dataset yields no batches")]
    NoBatches,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Loss(#[from] LossError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Optim(#[from] OptimError),

    #[error(transparent)]
    Momentum(#[from] MomentumError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Knn(#[from] KnnError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;

/// Scalar parts of one step's loss.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossParts {
    /// Loss on the final-layer output.
    pub output: f32,
    /// Intermediate-layer loss, before weighting.
    pub intermediate: Option<f32>,
    /// Loss through the predictor on detached student projections.
    pub detached: Option<f32>,
}

impl LossParts {
    fn add(&mut self, other: &LossParts) {
        let sum = |a: Option<f32>, b: Option<f32>| match (a, b) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.output += other.output;
        self.intermediate = sum(self.intermediate, other.intermediate);
        self.detached = sum(self.detached, other.detached);
    }

    fn scale(&mut self, factor: f32) {
        self.output *= factor;
        self.intermediate = self.intermediate.map(|v| v * factor);
        self.detached = self.detached.map(|v| v * factor);
    }
}

/// Output of [`Learner::compute_gradients`].
pub struct StepGradients {
    pub grads: GradStore,
    /// Total weighted loss.
    pub loss: f32,
    pub parts: LossParts,
}

/// What one [`Learner::train_step`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub loss: f32,
    pub parts: LossParts,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub schedule: ScheduledValues,
}

pub trait Learner: Send {
    fn method(&self) -> Method;

    fn state(&self) -> &OptimizationState;

    fn state_mut(&mut self) -> &mut OptimizationState;

    /// Network whose backbone embeds images for evaluation.
    fn eval_net(&self) -> &EmbeddingNet;

    /// Forward both views and backpropagate the step's loss.
    fn compute_gradients(&mut self, batch: &TwoViewBatch) -> Result<StepGradients>;

    fn synchronize_gradients(&self, grads: &mut StepGradients) -> Result<()> {
        self.state().synchronize(&mut grads.grads)
    }

    /// Returns the global gradient norm before clipping.
    fn clip(&self, grads: &mut StepGradients) -> Result<f64> {
        self.state().clip(&mut grads.grads)
    }

    fn apply_student_update(&mut self, grads: &StepGradients) -> Result<()> {
        self.state_mut().step_optimizer(&grads.grads)
    }

    fn apply_teacher_update(&mut self) -> Result<()>;

    fn advance(&mut self) {
        self.state_mut().advance();
    }

    /// Gradients of the mean loss over `micro_batches`, one backward pass
    /// per micro-batch.
    fn accumulate_gradients(&mut self, micro_batches: &[TwoViewBatch]) -> Result<StepGradients> {
        let step = self.state().step();
        let mut total: Option<StepGradients> = None;
        for batch in micro_batches {
            let grads = self.compute_gradients(batch)?;
            if !grads.loss.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    step,
                    value: grads.loss,
                });
            }
            total = Some(match total {
                None => grads,
                Some(mut acc) => {
                    self.state()
                        .accumulate_gradients(&mut acc.grads, &grads.grads)?;
                    acc.loss += grads.loss;
                    acc.parts.add(&grads.parts);
                    acc
                }
            });
        }
        let mut total = total.ok_or(TrainError::NoBatches)?;
        let n = micro_batches.len();
        if n > 1 {
            self.state()
                .scale_gradients(&mut total.grads, 1.0 / n as f64)?;
            total.loss /= n as f32;
            total.parts.scale(1.0 / n as f32);
        }
        Ok(total)
    }

    /// One optimizer step over the averaged gradients of `micro_batches`.
    fn train_accumulated(&mut self, micro_batches: &[TwoViewBatch]) -> Result<StepReport> {
        let schedule = self.state_mut().apply_schedules()?;
        let step = self.state().step();

        let mut grads = self.accumulate_gradients(micro_batches)?;
        self.synchronize_gradients(&mut grads)?;
        let grad_norm = self.clip(&mut grads)?;
        self.apply_student_update(&grads)?;
        self.apply_teacher_update()?;
        self.advance();

        tracing::trace!(
            step,
            micro_batches = micro_batches.len(),
            loss = grads.loss,
            grad_norm,
            lr = schedule.lr,
            "train step"
        );
        Ok(StepReport {
            step,
            loss: grads.loss,
            parts: grads.parts,
            grad_norm,
            schedule,
        })
    }

    fn train_step(&mut self, batch: &TwoViewBatch) -> Result<StepReport> {
        self.train_accumulated(std::slice::from_ref(batch))
    }
}

/// Rows `[(depth - 1) * b, d]` of the intermediate layers and `[b, d]` of the
/// final layer of a layer-major stack.
pub(crate) fn split_final_layer(stacked: &Tensor, depth: usize) -> Result<(Tensor, Tensor)> {
    let rows = stacked.dim(0)?;
    if depth < 2 || rows % depth != 0 {
        return Err(LossError::Shape(format!(
            "{rows} rows do not split into {depth} layers with intermediates"
        ))
        .into());
    }
    let batch = rows / depth;
    let mid = stacked.narrow(0, 0, rows - batch)?;
    let out = stacked.narrow(0, rows - batch, batch)?;
    Ok((mid, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn loss_parts_average_optional_terms() {
        let mut parts = LossParts {
            output: 1.0,
            intermediate: Some(2.0),
            detached: None,
        };
        parts.add(&LossParts {
            output: 3.0,
            intermediate: Some(4.0),
            detached: None,
        });
        parts.scale(0.5);
        assert_eq!(
            parts,
            LossParts {
                output: 2.0,
                intermediate: Some(3.0),
                detached: None,
            }
        );
    }

    #[test]
    fn split_keeps_final_layer_last() {
        let rows: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let stacked = Tensor::from_vec(rows, (6, 1), &Device::Cpu).unwrap();
        let (mid, out) = split_final_layer(&stacked, 3).unwrap();
        assert_eq!(mid.dims(), &[4, 1]);
        assert_eq!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![4.0, 5.0]);
        assert!(split_final_layer(&stacked, 4).is_err());
        assert!(split_final_layer(&stacked, 1).is_err());
    }
}
