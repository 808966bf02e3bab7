use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::optim::Optimizer as _;
pub use candle_nn::ParamsAdamW;

use super::{NamedVar, Optimizer, ParamGroups, Result};

/// Adam with decoupled weight decay, applied to the regularized group only.
///
/// Each group is a [`candle_nn::AdamW`]; the unregularized one keeps a zero
/// weight decay whatever the schedule says.
pub struct AdamW {
    regularized: candle_nn::AdamW,
    not_regularized: candle_nn::AdamW,
}

impl AdamW {
    pub fn new(groups: &ParamGroups, params: ParamsAdamW) -> Result<Self> {
        let vars = |named: &[NamedVar]| -> Vec<Var> { named.iter().map(|p| p.var.clone()).collect() };
        let regularized = candle_nn::AdamW::new(vars(&groups.regularized), params.clone())?;
        let not_regularized = candle_nn::AdamW::new(
            vars(&groups.not_regularized),
            ParamsAdamW {
                weight_decay: 0.0,
                ..params
            },
        )?;
        Ok(Self {
            regularized,
            not_regularized,
        })
    }

    /// Zero learning rate and weight decay; the trainer schedules both.
    pub fn scheduled(groups: &ParamGroups) -> Result<Self> {
        Self::new(
            groups,
            ParamsAdamW {
                lr: 0.0,
                weight_decay: 0.0,
                ..ParamsAdamW::default()
            },
        )
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.regularized.step(grads)?;
        self.not_regularized.step(grads)?;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.regularized.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.regularized.set_learning_rate(lr);
        self.not_regularized.set_learning_rate(lr);
    }

    fn weight_decay(&self) -> f64 {
        self.regularized.params().weight_decay
    }

    fn set_weight_decay(&mut self, weight_decay: f64) {
        let params = ParamsAdamW {
            weight_decay,
            ..self.regularized.params().clone()
        };
        self.regularized.set_params(params);
    }
}
