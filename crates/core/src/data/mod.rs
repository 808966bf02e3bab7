//! Datasets, augmentations and loaders.
//!
//! Three sources are supported:
//! - [`Stl10`] - the STL-10 binary distribution
//! - [`ImageFolder`] - `train/<class>/*` and `val/<class>/*` trees
//! - [`SyntheticDataset`] - procedural images, no files needed
//!
//! A run uses three splits: an unlabelled pretraining split fed through
//! two-view augmentation, a labelled split embedded into the KNN bank, and a
//! labelled validation split.

mod folder;
mod frame;
mod loader;
mod stl10;
mod synthetic;
pub mod transforms;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use folder::ImageFolder;
pub use frame::Frame;
pub use loader::{shard_indices, EvalLoader, LabeledBatch, LoaderConfig, TwoViewBatch, TwoViewLoader};
pub use stl10::{decode_record, Stl10, Stl10Split, STL10_CLASSES, STL10_SIDE};
pub use synthetic::SyntheticDataset;
pub use transforms::{eval_transform, Compose, Transform, TwoViews};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("malformed data: {0}")]
    Format(String),

    #[error("dataset is empty")]
    Empty,

    #[error("index {index} out of range for {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("sample {index} has no label")]
    Unlabeled { index: usize },

    #[error("unknown dataset: {0} (expected stl10, image-folder or synthetic)")]
    UnknownDataset(String),

    #[error("invalid loader configuration: {0}")]
    InvalidConfig(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;

/// Random-access image source.
pub trait ImageDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image `index`, values in `[0, 1]`.
    fn get(&self, index: usize) -> Result<Frame>;

    fn label(&self, index: usize) -> Option<u32>;

    fn num_classes(&self) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKind {
    #[default]
    Stl10,
    ImageFolder,
    Synthetic,
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Stl10 => "stl10",
            DatasetKind::ImageFolder => "image-folder",
            DatasetKind::Synthetic => "synthetic",
        }
    }

    /// Side of the images fed to the model.
    pub fn default_image_size(&self) -> usize {
        match self {
            DatasetKind::Stl10 => STL10_SIDE,
            DatasetKind::ImageFolder => 224,
            DatasetKind::Synthetic => 32,
        }
    }

    /// Side of the square resize before the evaluation center crop.
    pub fn eval_resize(&self, image_size: usize) -> usize {
        match self {
            DatasetKind::ImageFolder => image_size * 256 / 224,
            DatasetKind::Stl10 | DatasetKind::Synthetic => image_size,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "stl10" => Ok(DatasetKind::Stl10),
            "image-folder" | "imagenet" => Ok(DatasetKind::ImageFolder),
            "synthetic" => Ok(DatasetKind::Synthetic),
            other => Err(DataError::UnknownDataset(other.to_string())),
        }
    }
}

/// The three splits of one run.
#[derive(Clone)]
pub struct DataSplits {
    pub pretrain: Arc<dyn ImageDataset>,
    pub bank: Arc<dyn ImageDataset>,
    pub val: Arc<dyn ImageDataset>,
}

/// Sizes of the synthetic splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticSizes {
    pub train: usize,
    pub val: usize,
    pub num_classes: usize,
}

impl Default for SyntheticSizes {
    fn default() -> Self {
        Self {
            train: 512,
            val: 128,
            num_classes: 10,
        }
    }
}

pub fn open_splits(
    kind: DatasetKind,
    root: &Path,
    image_size: usize,
    synthetic: SyntheticSizes,
    seed: u64,
) -> Result<DataSplits> {
    let splits = match kind {
        DatasetKind::Stl10 => DataSplits {
            pretrain: Arc::new(Stl10::open(root, Stl10Split::Unlabeled)?),
            bank: Arc::new(Stl10::open(root, Stl10Split::Train)?),
            val: Arc::new(Stl10::open(root, Stl10Split::Test)?),
        },
        DatasetKind::ImageFolder => {
            let train: Arc<dyn ImageDataset> = Arc::new(ImageFolder::open(root.join("train"))?);
            DataSplits {
                pretrain: Arc::clone(&train),
                bank: train,
                val: Arc::new(ImageFolder::open(root.join("val"))?),
            }
        }
        DatasetKind::Synthetic => {
            let train: Arc<dyn ImageDataset> = Arc::new(SyntheticDataset::new(
                synthetic.train,
                synthetic.num_classes,
                image_size,
                seed,
            ));
            DataSplits {
                pretrain: Arc::clone(&train),
                bank: train,
                val: Arc::new(
                    SyntheticDataset::new(synthetic.val, synthetic.num_classes, image_size, seed)
                        .with_noise_offset(synthetic.train as u64),
                ),
            }
        }
    };
    tracing::info!(
        dataset = %kind,
        pretrain = splits.pretrain.len(),
        bank = splits.bank.len(),
        val = splits.val.len(),
        "datasets ready"
    );
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("STL10".parse::<DatasetKind>().unwrap(), DatasetKind::Stl10);
        assert_eq!(
            "image_folder".parse::<DatasetKind>().unwrap(),
            DatasetKind::ImageFolder
        );
        assert_eq!(DatasetKind::Synthetic.to_string(), "synthetic");
        assert!("cifar".parse::<DatasetKind>().is_err());
        assert_eq!(DatasetKind::ImageFolder.eval_resize(224), 256);
    }

    #[test]
    fn synthetic_splits_share_classes() {
        let splits = open_splits(
            DatasetKind::Synthetic,
            Path::new("."),
            8,
            SyntheticSizes {
                train: 6,
                val: 3,
                num_classes: 3,
            },
            0,
        )
        .unwrap();
        assert_eq!(splits.pretrain.len(), 6);
        assert_eq!(splits.val.len(), 3);
        assert_eq!(splits.val.num_classes(), Some(3));
        assert_ne!(splits.bank.get(0).unwrap(), splits.val.get(0).unwrap());
    }
}
