use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use super::{Optimizer, ParamGroups, Result};

pub const LARS_ETA: f64 = 0.001;
pub const LARS_MOMENTUM: f64 = 0.9;

struct Slot {
    var: Var,
    regularized: bool,
    mu: Tensor,
}

/// Layer-wise adaptive rate scaling.
///
/// Rank-1 parameters skip both weight decay and the trust-ratio scaling.
pub struct Lars {
    slots: Vec<Slot>,
    lr: f64,
    weight_decay: f64,
    momentum: f64,
    eta: f64,
}

impl Lars {
    pub fn new(groups: &ParamGroups, lr: f64) -> Result<Self> {
        let slots = groups
            .iter()
            .map(|(p, regularized)| {
                Ok(Slot {
                    var: p.var.clone(),
                    regularized,
                    mu: p.var.zeros_like()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            lr,
            weight_decay: 0.0,
            momentum: LARS_MOMENTUM,
            eta: LARS_ETA,
        })
    }
}

fn norm(t: &Tensor) -> Result<f64> {
    let sq = t.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
    Ok((sq as f64).sqrt())
}

impl Optimizer for Lars {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let param = slot.var.as_tensor();
            let mut dp = grad.clone();
            if param.rank() != 1 {
                let decay = if slot.regularized { self.weight_decay } else { 0.0 };
                dp = (dp + param.affine(decay, 0.0)?)?;

                let param_norm = norm(param)?;
                let update_norm = norm(&dp)?;
                let trust = if param_norm > 0.0 && update_norm > 0.0 {
                    self.eta * param_norm / update_norm
                } else {
                    1.0
                };
                dp = dp.affine(trust, 0.0)?;
            }
            let mu = ((&slot.mu * self.momentum)? + dp)?;
            slot.var.set(&(param - (&mu * self.lr)?)?)?;
            slot.mu = mu;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    fn set_weight_decay(&mut self, weight_decay: f64) {
        self.weight_decay = weight_decay;
    }
}
