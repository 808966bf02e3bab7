//! Run configuration for the trainer binary.
//!
//! Values are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config`, or ~/.config/mvit-train/config.toml)
//! 3. Default values (lowest priority)
//!
//! Config files are TOML unless their extension is `.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use mvit_core::config::Arch;
use mvit_core::data::{DatasetKind, SyntheticSizes};
use mvit_core::optim::OptimizerKind;
use mvit_core::trainer::{Method, TrainerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("no config directory available")]
    NoConfigDir,

    #[error(transparent)]
    Invalid(#[from] mvit_core::trainer::TrainError),
}

/// Every tunable of a run. Unset fields fall through to the next source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Args)]
pub struct RunConfig {
    /// Training method: momentum or simclr
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Backbone: vit_tiny, vit_small, vit_base, deit_small, deit_base
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_size: Option<usize>,

    /// Input side; defaults to 96 for stl10 and 224 otherwise
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<usize>,

    /// Add a distillation token
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dis_token: Option<bool>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_path_rate: Option<f32>,

    /// Output dimension of projector and predictor
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dim: Option<usize>,

    /// Hidden dimension of the head MLPs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlp_hidden: Option<usize>,

    /// Supervise every block of the student
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub st_inter: Option<bool>,

    /// adamw, sgd or lars
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerKind>,

    /// Learning rate per 256 images
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lr: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_lr: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_decay_end: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momentum_teacher: Option<f64>,

    /// Maximum global gradient norm, 0 disables clipping
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_grad: Option<f64>,

    /// Weight of the intermediate-layer loss
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size_per_worker: Option<usize>,

    /// Micro-batches per optimizer step
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulate: Option<usize>,

    /// Number of data-parallel worker threads
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,

    /// Seconds a worker waits for its peers in a collective; unset waits forever
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collective_timeout_secs: Option<u64>,

    /// Length of the schedules in epochs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,

    /// Epochs actually trained
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_epochs: Option<usize>,

    /// KNN evaluation interval in epochs, 0 disables it
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_interval: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knn_k: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// stl10, image-folder or synthetic
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetKind>,

    /// Dataset root directory
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,

    /// Size of the synthetic training split
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthetic_train: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthetic_val: Option<usize>,

    /// Directory of the event logs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_path: Option<PathBuf>,

    /// Run name; events go to `board_path/name`
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A fully resolved run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub trainer: TrainerConfig,
    pub dataset: DatasetKind,
    pub data_path: PathBuf,
    pub synthetic: SyntheticSizes,
    pub eval_resize: usize,
    pub collective_timeout: Option<Duration>,
    pub board_path: PathBuf,
    pub name: String,
}

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

macro_rules! apply_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$src.$field {
                $dst.$field = value.clone();
            }
        )+
    };
}

impl RunConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mvit-train").join("config.toml"))
    }

    /// Load the default config file, or an empty config when there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a TOML or JSON file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if is_json(path) {
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })
        } else {
            toml::from_str(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = if is_json(path) {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        };
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &RunConfig) {
        merge_fields!(
            self,
            other,
            method,
            arch,
            patch_size,
            image_size,
            dis_token,
            drop_path_rate,
            out_dim,
            mlp_hidden,
            st_inter,
            optimizer,
            lr,
            min_lr,
            weight_decay,
            weight_decay_end,
            momentum_teacher,
            clip_grad,
            ratio,
            temperature,
            batch_size_per_worker,
            accumulate,
            world_size,
            epochs,
            max_epochs,
            warmup_epochs,
            val_interval,
            knn_k,
            seed,
            collective_timeout_secs,
            dataset,
            data_path,
            synthetic_train,
            synthetic_val,
            board_path,
            name,
        );
    }

    /// Fill every unset field from the defaults and validate the result.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let dataset = self.dataset.unwrap_or_default();
        let mut trainer = TrainerConfig {
            image_size: dataset.default_image_size(),
            ..TrainerConfig::default()
        };
        apply_fields!(
            trainer,
            self,
            method,
            arch,
            patch_size,
            image_size,
            dis_token,
            drop_path_rate,
            out_dim,
            mlp_hidden,
            st_inter,
            optimizer,
            lr,
            min_lr,
            weight_decay,
            weight_decay_end,
            momentum_teacher,
            clip_grad,
            ratio,
            batch_size_per_worker,
            accumulate,
            world_size,
            epochs,
            max_epochs,
            warmup_epochs,
            val_interval,
            knn_k,
            seed,
        );
        trainer.temperature = self.temperature;
        // max_epochs follows a shortened schedule unless set explicitly
        if self.max_epochs.is_none() {
            trainer.max_epochs = trainer.epochs;
        }
        trainer.validate()?;

        let defaults = SyntheticSizes::default();
        Ok(ResolvedConfig {
            eval_resize: dataset.eval_resize(trainer.image_size),
            collective_timeout: self.collective_timeout_secs.map(Duration::from_secs),
            trainer,
            dataset,
            data_path: self.data_path.clone().unwrap_or_else(|| PathBuf::from("./data")),
            synthetic: SyntheticSizes {
                train: self.synthetic_train.unwrap_or(defaults.train),
                val: self.synthetic_val.unwrap_or(defaults.val),
                num_classes: defaults.num_classes,
            },
            board_path: self.board_path.clone().unwrap_or_else(|| PathBuf::from("./log")),
            name: self.name.clone().unwrap_or_else(|| default_run_name(self)),
        })
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn default_run_name(cfg: &RunConfig) -> String {
    format!(
        "{}_{}_{}",
        cfg.method.unwrap_or_default(),
        cfg.arch.unwrap_or(Arch::VitSmall),
        cfg.dataset.unwrap_or_default()
    )
}
