use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;

use super::{Result, TrainError, TrainerConfig};
use crate::distributed::{all_reduce_gradients, DeviceCommunicator};
use crate::optim::{build_optimizer, clip_grad_norm, Optimizer, ParamGroups};
use crate::schedule::{ScheduledValues, Schedules};

/// Optimizer, schedules and step counter of the trained network.
pub struct OptimizationState {
    groups: ParamGroups,
    vars: Vec<Var>,
    optimizer: Box<dyn Optimizer>,
    schedules: Schedules,
    clip_grad: f64,
    step: usize,
    current: ScheduledValues,
    comm: Arc<dyn DeviceCommunicator>,
}

impl OptimizationState {
    /// Group the trainable variables of `varmap`, skipping `frozen_prefixes`.
    pub fn new(
        cfg: &TrainerConfig,
        varmap: &VarMap,
        frozen_prefixes: &[String],
        steps_per_epoch: usize,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self> {
        if comm.world_size() != cfg.world_size {
            return Err(TrainError::InvalidConfig(format!(
                "configured world_size {} but the communicator spans {} workers",
                cfg.world_size,
                comm.world_size()
            )));
        }
        let groups = ParamGroups::from_varmap(varmap, frozen_prefixes)?;
        if groups.is_empty() {
            return Err(TrainError::InvalidConfig("no trainable parameters".into()));
        }
        let vars = groups.vars();
        let optimizer = build_optimizer(cfg.optimizer, &groups)?;
        let schedules = Schedules::new(&cfg.schedule_config(), steps_per_epoch)?;
        let current = schedules.at(0)?;

        tracing::info!(
            rank = comm.rank(),
            params = groups.num_elements(),
            tensors = groups.len(),
            steps = schedules.len(),
            base_lr = cfg.base_lr(),
            "optimization state ready"
        );
        Ok(Self {
            groups,
            vars,
            optimizer,
            schedules,
            clip_grad: cfg.clip_grad,
            step: 0,
            current,
            comm,
        })
    }

    /// Push the scheduled lr and weight decay of the current step into the
    /// optimizer and return every scheduled value.
    pub fn apply_schedules(&mut self) -> Result<ScheduledValues> {
        let values = self.schedules.at(self.step)?;
        self.optimizer.set_learning_rate(values.lr);
        self.optimizer.set_weight_decay(values.weight_decay);
        self.current = values;
        Ok(values)
    }

    /// Add the gradients of the trained variables in `other` into `acc`.
    pub fn accumulate_gradients(&self, acc: &mut GradStore, other: &GradStore) -> Result<()> {
        for var in &self.vars {
            let Some(grad) = other.get(var.as_tensor()) else {
                continue;
            };
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => (prev + grad)?,
                None => grad.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
        Ok(())
    }

    pub fn scale_gradients(&self, grads: &mut GradStore, factor: f64) -> Result<()> {
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let scaled = (grad * factor)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
        Ok(())
    }

    pub fn synchronize(&self, grads: &mut GradStore) -> Result<()> {
        all_reduce_gradients(grads, &self.vars, self.comm.as_ref())?;
        Ok(())
    }

    pub fn clip(&self, grads: &mut GradStore) -> Result<f64> {
        Ok(clip_grad_norm(grads, &self.vars, self.clip_grad)?)
    }

    pub fn step_optimizer(&mut self, grads: &GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        Ok(())
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Global step of the next update.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Scheduled values last applied.
    pub fn current(&self) -> ScheduledValues {
        self.current
    }

    pub fn schedules(&self) -> &Schedules {
        &self.schedules
    }

    pub fn groups(&self) -> &ParamGroups {
        &self.groups
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn comm(&self) -> &dyn DeviceCommunicator {
        self.comm.as_ref()
    }

    pub fn shared_comm(&self) -> Arc<dyn DeviceCommunicator> {
        Arc::clone(&self.comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;
    use crate::optim::global_grad_norm;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn config() -> TrainerConfig {
        TrainerConfig {
            lr: 0.256,
            min_lr: 0.0,
            batch_size_per_worker: 100,
            epochs: 2,
            max_epochs: 2,
            warmup_epochs: 1,
            clip_grad: 0.5,
            ..TrainerConfig::default()
        }
    }

    fn state(varmap: &VarMap) -> OptimizationState {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((1, 2), "fc.weight", Init::Const(1.0)).unwrap();
        vb.get_with_hints((1, 2), "frozen.weight", Init::Const(1.0)).unwrap();
        OptimizationState::new(
            &config(),
            varmap,
            &["frozen.".to_string()],
            2,
            Arc::new(LocalCommunicator::new()),
        )
        .unwrap()
    }

    #[test]
    fn schedules_follow_the_step_counter() {
        let varmap = VarMap::new();
        let mut state = state(&varmap);
        assert_eq!(state.groups().len(), 1);

        let first = state.apply_schedules().unwrap();
        assert_eq!(first.lr, 0.0);
        assert_eq!(state.optimizer().learning_rate(), 0.0);
        state.advance();
        let second = state.apply_schedules().unwrap();
        assert!((second.lr - 0.1).abs() < 1e-12);
        assert_eq!(state.current(), second);

        for _ in 0..3 {
            state.advance();
        }
        assert!(matches!(state.apply_schedules(), Err(TrainError::Schedule(_))));
    }

    #[test]
    fn clip_reports_norm_before_clipping() {
        let varmap = VarMap::new();
        let state = state(&varmap);
        let var = state.groups().regularized[0].var.clone();
        let loss = (var.as_tensor() * 2.0).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let norm = state.clip(&mut grads).unwrap();
        assert!((norm - 8f64.sqrt()).abs() < 1e-5);
        let clipped = global_grad_norm(&grads, &[var]).unwrap();
        assert!((clipped - 0.5).abs() < 1e-5);
    }

    #[test]
    fn averaged_half_batches_match_the_full_batch() {
        let varmap = VarMap::new();
        let state = state(&varmap);
        let var = state.groups().regularized[0].var.clone();
        let inputs = Tensor::new(&[[1f32, 2.0], [0.5, -1.0], [3.0, 0.0], [-2.0, 1.5]], &Device::Cpu)
            .unwrap();
        // Mean squared projection of the rows onto the weight.
        let grads_of = |rows: &Tensor| {
            let proj = rows.matmul(&var.as_tensor().t().unwrap()).unwrap();
            proj.sqr().unwrap().mean_all().unwrap().backward().unwrap()
        };
        let full = grads_of(&inputs);

        let mut acc = grads_of(&inputs.narrow(0, 0, 2).unwrap());
        state
            .accumulate_gradients(&mut acc, &grads_of(&inputs.narrow(0, 2, 2).unwrap()))
            .unwrap();
        state.scale_gradients(&mut acc, 0.5).unwrap();

        let expected: Vec<f32> = full.get(var.as_tensor()).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let got: Vec<f32> = acc.get(var.as_tensor()).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in got.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5, "{got:?} vs {expected:?}");
        }
    }

    #[test]
    fn world_size_must_match_communicator() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2, "w", Init::Const(1.0)).unwrap();
        let cfg = TrainerConfig {
            world_size: 2,
            ..config()
        };
        let err = OptimizationState::new(&cfg, &varmap, &[], 2, Arc::new(LocalCommunicator::new()));
        assert!(matches!(err, Err(TrainError::InvalidConfig(_))));
    }
}
