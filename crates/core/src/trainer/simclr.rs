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
use crate::loss::{intermediate_info_nce, scalar, self_similarity_info_nce};

/// A single network trained on the self-similarity objective of its two
/// views. Negatives come from the local batch only.
pub struct SimClrLearner {
    student: EmbeddingNet,
    student_vars: VarMap,
    state: OptimizationState,
    temperature: f64,
    /// Fixed weight of the intermediate loss.
    ratio: f64,
}

impl SimClrLearner {
    pub fn new(
        cfg: &TrainerConfig,
        steps_per_epoch: usize,
        comm: Arc<dyn DeviceCommunicator>,
        device: &Device,
    ) -> Result<Self> {
        cfg.validate()?;
        let vit = cfg.vit_config();

        let student_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&student_vars, DType::F32, device);
        let student = EmbeddingNet::new(&vit, &cfg.head_config(), cfg.st_inter, false, vb)?;
        broadcast_parameters(&student_vars, comm.as_ref())?;

        let state = OptimizationState::new(
            cfg,
            &student_vars,
            &student.frozen_prefixes(),
            steps_per_epoch,
            comm,
        )?;
        let ratio = if cfg.ratio > 0.0 {
            cfg.ratio
        } else {
            vit.depth.saturating_sub(1) as f64
        };
        tracing::info!(arch = %cfg.arch, st_inter = cfg.st_inter, ratio, "simclr learner built");
        Ok(Self {
            student,
            student_vars,
            state,
            temperature: cfg.temperature(),
            ratio,
        })
    }

    pub fn student(&self) -> &EmbeddingNet {
        &self.student
    }

    pub fn student_vars(&self) -> &VarMap {
        &self.student_vars
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    fn loss(&self, f1: &Tensor, f2: &Tensor) -> Result<(Tensor, LossParts)> {
        let tau = self.temperature;
        if !self.student.is_intermediate() {
            let loss = self_similarity_info_nce(&Tensor::cat(&[f1, f2], 0)?, tau)?.loss;
            let parts = LossParts {
                output: scalar(&loss)?,
                ..LossParts::default()
            };
            return Ok((loss, parts));
        }

        let depth = self.student.depth();
        let (mid1, out1) = split_final_layer(f1, depth)?;
        let (mid2, out2) = split_final_layer(f2, depth)?;
        // Each view's intermediate layers chase the other view's output.
        let intermediate = (intermediate_info_nce(&mid1, &out2, depth - 1, tau)?.loss
            + intermediate_info_nce(&mid2, &out1, depth - 1, tau)?.loss)?;
        let output = self_similarity_info_nce(&Tensor::cat(&[&out1, &out2], 0)?, tau)?.loss;

        let loss = (&output + intermediate.affine(self.ratio, 0.0)?)?;
        let parts = LossParts {
            output: scalar(&output)?,
            intermediate: Some(scalar(&intermediate)?),
            detached: None,
        };
        Ok((loss, parts))
    }
}

impl Learner for SimClrLearner {
    fn method(&self) -> Method {
        Method::Simclr
    }

    fn state(&self) -> &OptimizationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OptimizationState {
        &mut self.state
    }

    fn eval_net(&self) -> &EmbeddingNet {
        &self.student
    }

    fn compute_gradients(&mut self, batch: &TwoViewBatch) -> Result<StepGradients> {
        let f1 = self.student.forward_t(&batch.view1, true)?;
        let f2 = self.student.forward_t(&batch.view2, true)?;
        let (loss, parts) = self.loss(&f1, &f2)?;
        let value = scalar(&loss)?;
        let grads = loss.backward()?;
        Ok(StepGradients {
            grads,
            loss: value,
            parts,
        })
    }

    fn apply_teacher_update(&mut self) -> Result<()> {
        Ok(())
    }
}
