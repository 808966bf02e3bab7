use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use super::{Optimizer, ParamGroups, Result};

pub const SGD_MOMENTUM: f64 = 0.9;

struct Slot {
    var: Var,
    regularized: bool,
    buffer: Option<Tensor>,
}

/// SGD with heavy-ball momentum and L2 weight decay added to the gradient.
pub struct Sgd {
    slots: Vec<Slot>,
    lr: f64,
    momentum: f64,
    weight_decay: f64,
}

impl Sgd {
    pub fn new(groups: &ParamGroups, lr: f64, momentum: f64) -> Self {
        let slots = groups
            .iter()
            .map(|(p, regularized)| Slot {
                var: p.var.clone(),
                regularized,
                buffer: None,
            })
            .collect();
        Self {
            slots,
            lr,
            momentum,
            weight_decay: 0.0,
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let grad = if slot.regularized && self.weight_decay != 0.0 {
                (grad + slot.var.as_tensor().affine(self.weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };
            let buffer = match &slot.buffer {
                Some(buf) => ((buf * self.momentum)? + grad)?,
                None => grad,
            };
            let updated = (slot.var.as_tensor() - (&buffer * self.lr)?)?;
            slot.var.set(&updated)?;
            slot.buffer = Some(buffer);
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
