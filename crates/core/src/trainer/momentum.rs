use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use super::{
    split_final_layer, Learner, LossParts, Method, OptimizationState, Result, StepGradients,
    TrainerConfig,
};
use crate::data::TwoViewBatch;
use crate::distributed::{broadcast_parameters, DeviceCommunicator};
use crate::head::EmbeddingNet;
use crate::loss::{cross_batch_info_nce, layerwise_info_nce, scalar};
use crate::momentum::{HeadPolicy, MomentumSync};

/// Student with predictor trained against an EMA teacher.
///
/// Each view's student projection is contrasted with the teacher projection
/// of the other view, gathered across all workers.
pub struct MomentumLearner {
    student: EmbeddingNet,
    teacher: EmbeddingNet,
    student_vars: VarMap,
    teacher_vars: VarMap,
    sync: MomentumSync,
    state: OptimizationState,
    temperature: f64,
}

impl MomentumLearner {
    pub fn new(
        cfg: &TrainerConfig,
        steps_per_epoch: usize,
        comm: Arc<dyn DeviceCommunicator>,
        device: &Device,
    ) -> Result<Self> {
        cfg.validate()?;
        let vit = cfg.vit_config();
        let head = cfg.head_config();

        let student_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&student_vars, DType::F32, device);
        let student = EmbeddingNet::new(&vit, &head, cfg.st_inter, true, vb)?;
        broadcast_parameters(&student_vars, comm.as_ref())?;

        let teacher_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&teacher_vars, DType::F32, device);
        let teacher = EmbeddingNet::new(&vit, &head, false, false, vb)?;

        let policy = HeadPolicy::for_modes(cfg.st_inter, false, vit.depth)?;
        let sync = MomentumSync::new(&student_vars, &teacher_vars, policy)?;
        sync.copy_student_into_teacher()?;

        let state = OptimizationState::new(
            cfg,
            &student_vars,
            &student.frozen_prefixes(),
            steps_per_epoch,
            comm,
        )?;
        tracing::info!(
            arch = %cfg.arch,
            st_inter = cfg.st_inter,
            teacher_params = sync.len(),
            "momentum learner built"
        );
        Ok(Self {
            student,
            teacher,
            student_vars,
            teacher_vars,
            sync,
            state,
            temperature: cfg.temperature(),
        })
    }

    pub fn student(&self) -> &EmbeddingNet {
        &self.student
    }

    pub fn teacher(&self) -> &EmbeddingNet {
        &self.teacher
    }

    pub fn student_vars(&self) -> &VarMap {
        &self.student_vars
    }

    pub fn teacher_vars(&self) -> &VarMap {
        &self.teacher_vars
    }

    pub fn sync(&self) -> &MomentumSync {
        &self.sync
    }

    /// Teacher projection of `view`, detached and gathered in rank order.
    fn teacher_targets(&self, view: &Tensor) -> Result<Tensor> {
        let local = self.teacher.forward_t(view, true)?.detach();
        Ok(self.state.comm().all_gather(&local, 0)?)
    }

    /// `(loss, parts)` for one pair of student projections and their targets.
    fn loss(&self, students: [&Tensor; 2], targets: [&Tensor; 2]) -> Result<(Tensor, LossParts)> {
        let rank = self.state.comm().rank();
        let tau = self.temperature;

        if !self.student.is_intermediate() {
            let mut terms = Vec::with_capacity(2);
            for (s, t) in students.iter().zip(targets) {
                let pred = self.student.predict(s)?;
                terms.push(cross_batch_info_nce(&pred, t, tau, rank)?.loss);
            }
            let loss = (&terms[0] + &terms[1])?;
            let parts = LossParts {
                output: scalar(&loss)?,
                ..LossParts::default()
            };
            return Ok((loss, parts));
        }

        let depth = self.student.depth();
        let ratio = self.state.current().ratio;
        let mut output = Vec::with_capacity(2);
        let mut intermediate = Vec::with_capacity(2);
        let mut detached = Vec::with_capacity(2);
        for (s, t) in students.iter().zip(targets) {
            // Only the predictor learns from this term.
            let pred_detached = self.student.predict(&s.detach())?;
            detached.push(layerwise_info_nce(&pred_detached, t, depth, tau, rank)?.loss);

            let pred = self.student.predict(s)?;
            let (mid, out) = split_final_layer(&pred, depth)?;
            output.push(cross_batch_info_nce(&out, t, tau, rank)?.loss);
            intermediate.push(layerwise_info_nce(&mid, t, depth - 1, tau, rank)?.loss);
        }
        let output = (&output[0] + &output[1])?;
        let intermediate = (&intermediate[0] + &intermediate[1])?;
        let detached = (&detached[0] + &detached[1])?;

        let loss = ((&output + intermediate.affine(ratio, 0.0)?)?
            + detached.affine(depth as f64, 0.0)?)?;
        let parts = LossParts {
            output: scalar(&output)?,
            intermediate: Some(scalar(&intermediate)?),
            detached: Some(scalar(&detached)?),
        };
        Ok((loss, parts))
    }
}

impl Learner for MomentumLearner {
    fn method(&self) -> Method {
        Method::Momentum
    }

    fn state(&self) -> &OptimizationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OptimizationState {
        &mut self.state
    }

    fn eval_net(&self) -> &EmbeddingNet {
        &self.teacher
    }

    fn compute_gradients(&mut self, batch: &TwoViewBatch) -> Result<StepGradients> {
        let (x1, x2) = (&batch.view1, &batch.view2);
        // Cross-view pairing: the student sees the other view.
        let teacher1 = self.teacher_targets(x1)?;
        let student1 = self.student.forward_t(x2, true)?;
        let teacher2 = self.teacher_targets(x2)?;
        let student2 = self.student.forward_t(x1, true)?;

        let (loss, parts) = self.loss([&student1, &student2], [&teacher1, &teacher2])?;
        let value = scalar(&loss)?;
        let grads = loss.backward()?;
        Ok(StepGradients {
            grads,
            loss: value,
            parts,
        })
    }

    fn apply_teacher_update(&mut self) -> Result<()> {
        self.sync.ema_update(self.state.current().momentum)?;
        Ok(())
    }
}
