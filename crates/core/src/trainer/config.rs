//! Training hyperparameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Result, TrainError};
use crate::config::{Arch, VitConfig};
use crate::head::HeadConfig;
use crate::loss::{MOMENTUM_TEMPERATURE, SIMCLR_TEMPERATURE};
use crate::optim::OptimizerKind;
use crate::schedule::ScheduleConfig;

/// Reference batch size of the linear learning-rate scaling rule.
pub const LR_REFERENCE_BATCH: f64 = 256.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Student with predictor against an EMA teacher.
    #[default]
    Momentum,
    /// Single network, two views, self-similarity objective.
    Simclr,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Momentum => "momentum",
            Method::Simclr => "simclr",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "momentum" | "byol" | "moco" => Ok(Method::Momentum),
            "simclr" => Ok(Method::Simclr),
            other => Err(TrainError::UnknownMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub method: Method,
    pub arch: Arch,
    pub patch_size: usize,
    pub image_size: usize,
    /// Force a distillation token on top of the preset.
    pub dis_token: bool,
    pub drop_path_rate: f32,
    pub out_dim: usize,
    pub mlp_hidden: usize,
    /// Supervise every block of the student through its own projector.
    pub st_inter: bool,
    pub optimizer: OptimizerKind,
    /// Learning rate per 256 images; scaled by the global batch size.
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub weight_decay_end: f64,
    pub momentum_teacher: f64,
    /// Global gradient-norm bound; 0 disables clipping.
    pub clip_grad: f64,
    /// Weight of the intermediate-layer loss.
    pub ratio: f64,
    /// InfoNCE temperature; the method's default when unset.
    pub temperature: Option<f64>,
    pub batch_size_per_worker: usize,
    /// Micro-batches whose gradients are averaged into one optimizer step.
    pub accumulate: usize,
    pub world_size: usize,
    /// Length of the schedules.
    pub epochs: usize,
    /// Epochs actually trained.
    pub max_epochs: usize,
    pub warmup_epochs: usize,
    /// KNN evaluation every this many epochs; 0 disables it.
    pub val_interval: usize,
    pub knn_k: usize,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            method: Method::Momentum,
            arch: Arch::VitSmall,
            patch_size: 16,
            image_size: 96,
            dis_token: false,
            drop_path_rate: 0.0,
            out_dim: 512,
            mlp_hidden: 4096,
            st_inter: false,
            optimizer: OptimizerKind::AdamW,
            lr: 1e-5,
            min_lr: 1e-6,
            weight_decay: 0.04,
            weight_decay_end: 0.4,
            momentum_teacher: 0.996,
            clip_grad: 3.0,
            ratio: 1.0,
            temperature: None,
            batch_size_per_worker: 256,
            accumulate: 1,
            world_size: 1,
            epochs: 300,
            max_epochs: 300,
            warmup_epochs: 10,
            val_interval: 1,
            knn_k: crate::knn::DEFAULT_K,
            seed: 0,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TrainError::InvalidConfig(msg));
        if self.batch_size_per_worker == 0 {
            return invalid("batch_size_per_worker must be > 0".into());
        }
        if self.accumulate == 0 {
            return invalid("accumulate must be > 0".into());
        }
        if self.world_size == 0 {
            return invalid("world_size must be > 0".into());
        }
        if self.epochs == 0 {
            return invalid("epochs must be > 0".into());
        }
        if self.max_epochs > self.epochs {
            return invalid(format!(
                "max_epochs {} exceeds the {} scheduled epochs",
                self.max_epochs, self.epochs
            ));
        }
        if self.warmup_epochs > self.epochs {
            return invalid(format!(
                "warmup_epochs {} exceeds epochs {}",
                self.warmup_epochs, self.epochs
            ));
        }
        if !(0.0..=1.0).contains(&self.momentum_teacher) {
            return invalid(format!(
                "momentum_teacher {} is outside [0, 1]",
                self.momentum_teacher
            ));
        }
        if self.temperature.is_some_and(|t| t <= 0.0) {
            return invalid("temperature must be > 0".into());
        }
        if self.knn_k == 0 {
            return invalid("knn_k must be > 0".into());
        }
        self.vit_config().validate()?;
        if self.st_inter && self.vit_config().depth < 2 {
            return invalid("st_inter needs depth >= 2".into());
        }
        Ok(())
    }

    pub fn vit_config(&self) -> VitConfig {
        let mut cfg = self.arch.config(self.patch_size, self.image_size);
        cfg.dis_token |= self.dis_token;
        cfg.drop_path_rate = self.drop_path_rate;
        cfg
    }

    pub fn head_config(&self) -> HeadConfig {
        HeadConfig {
            out_dim: self.out_dim,
            hidden_dim: self.mlp_hidden,
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(match self.method {
            Method::Momentum => MOMENTUM_TEMPERATURE,
            Method::Simclr => SIMCLR_TEMPERATURE,
        })
    }

    /// Images per optimizer step across all workers.
    pub fn total_batch(&self) -> usize {
        self.batch_size_per_worker * self.accumulate * self.world_size
    }

    /// `lr * total_batch / 256`.
    pub fn base_lr(&self) -> f64 {
        self.lr * self.total_batch() as f64 / LR_REFERENCE_BATCH
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            base_lr: self.base_lr(),
            min_lr: self.min_lr,
            weight_decay: self.weight_decay,
            weight_decay_end: self.weight_decay_end,
            momentum_teacher: self.momentum_teacher,
            ratio: self.ratio,
            epochs: self.epochs,
            warmup_epochs: self.warmup_epochs,
        }
    }
}
