//! Optimizers over grouped parameters.
//!
//! Every optimizer mutates its [`Var`]s in place from a [`GradStore`]. The
//! learning rate and weight decay are set per step by the trainer from the
//! cosine schedules; weight decay only touches the regularized group.
//!
//! [`Var`]: candle_core::Var

mod adamw;
mod clip;
mod groups;
mod lars;
mod sgd;

use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use adamw::{AdamW, ParamsAdamW};
pub use clip::{clip_grad_norm, global_grad_norm};
pub use groups::{NamedVar, ParamGroups};
pub use lars::{Lars, LARS_ETA, LARS_MOMENTUM};
pub use sgd::{Sgd, SGD_MOMENTUM};

#[derive(Error, Debug)]
pub enum OptimError {
    #[error("unknown optimizer: {0} (expected adamw, sgd or lars)")]
    UnknownOptimizer(String),

    #[error("parameter store lock poisoned")]
    Poisoned,

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, OptimError>;

pub trait Optimizer: Send {
    /// Apply one update from the gradients in `grads`. Parameters without a
    /// gradient are left untouched.
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn weight_decay(&self) -> f64;

    /// Weight decay of the regularized group.
    fn set_weight_decay(&mut self, weight_decay: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Sgd,
    Lars,
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::AdamW => "adamw",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Lars => "lars",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizerKind {
    type Err = OptimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adamw" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            "lars" => Ok(OptimizerKind::Lars),
            other => Err(OptimError::UnknownOptimizer(other.to_string())),
        }
    }
}

/// Build an optimizer of the given kind with a zero learning rate; the
/// trainer sets lr and weight decay before the first step.
pub fn build_optimizer(kind: OptimizerKind, groups: &ParamGroups) -> Result<Box<dyn Optimizer>> {
    tracing::debug!(
        optimizer = %kind,
        regularized = groups.regularized.len(),
        not_regularized = groups.not_regularized.len(),
        elements = groups.num_elements(),
        "building optimizer"
    );
    Ok(match kind {
        OptimizerKind::AdamW => Box::new(AdamW::scheduled(groups)?),
        OptimizerKind::Sgd => Box::new(Sgd::new(groups, 0.0, SGD_MOMENTUM)),
        OptimizerKind::Lars => Box::new(Lars::new(groups, 0.0)?),
    })
}
