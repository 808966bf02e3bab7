//! Batching, sharding and per-sample augmentation.
//!
//! Every rank walks the same seeded permutation of the dataset, padded to a
//! multiple of the world size, and keeps every `world_size`-th index starting
//! at its rank. Augmentation RNGs are seeded per (epoch, index, view), so a
//! sample's views do not depend on which rank or batch loads it.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::frame::Frame;
use super::transforms::{Compose, Transform, TwoViews};
use super::{DataError, ImageDataset, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: u64,
    pub rank: usize,
    pub world_size: usize,
}

impl LoaderConfig {
    fn validate(&self, len: usize) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DataError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(DataError::InvalidConfig(format!(
                "rank {} outside world of {}",
                self.rank, self.world_size
            )));
        }
        if len == 0 {
            return Err(DataError::Empty);
        }
        Ok(())
    }

    fn per_rank(&self, len: usize) -> usize {
        len.div_ceil(self.world_size)
    }

    fn num_batches(&self, len: usize) -> usize {
        let per_rank = self.per_rank(len);
        if self.drop_last {
            per_rank / self.batch_size
        } else {
            per_rank.div_ceil(self.batch_size)
        }
    }
}

/// Fold `parts` into `seed`, each through a freshly seeded [`StdRng`].
fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    parts
        .iter()
        .fold(seed, |acc, part| StdRng::seed_from_u64(acc ^ part).gen())
}

fn sample_rng(seed: u64, epoch: usize, index: usize, view: u64) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, &[epoch as u64, index as u64, view]))
}

/// The indices rank `rank` visits in `epoch`, in order.
pub fn shard_indices(len: usize, cfg: &LoaderConfig, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if cfg.shuffle {
        let mut rng = StdRng::seed_from_u64(derive_seed(cfg.seed, &[epoch as u64]));
        order.shuffle(&mut rng);
    }
    let total = cfg.per_rank(len) * cfg.world_size;
    let mut padded = order.clone();
    while padded.len() < total {
        let need = total - padded.len();
        padded.extend(order.iter().take(need).copied());
    }
    padded
        .into_iter()
        .skip(cfg.rank)
        .step_by(cfg.world_size)
        .collect()
}

/// Two augmented views of the same images.
#[derive(Debug, Clone)]
pub struct TwoViewBatch {
    pub view1: Tensor,
    pub view2: Tensor,
    pub indices: Vec<usize>,
}

/// Deterministically transformed images with their labels.
#[derive(Debug, Clone)]
pub struct LabeledBatch {
    pub images: Tensor,
    pub labels: Vec<u32>,
}

pub struct TwoViewLoader {
    dataset: Arc<dyn ImageDataset>,
    views: TwoViews,
    cfg: LoaderConfig,
    device: Device,
}

impl TwoViewLoader {
    pub fn new(
        dataset: Arc<dyn ImageDataset>,
        views: TwoViews,
        cfg: LoaderConfig,
        device: Device,
    ) -> Result<Self> {
        cfg.validate(dataset.len())?;
        Ok(Self {
            dataset,
            views,
            cfg,
            device,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.cfg.num_batches(self.dataset.len())
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    fn view(&self, transform: &Compose, frame: &Frame, epoch: usize, index: usize, view: u64) -> Frame {
        transform.apply(frame.clone(), &mut sample_rng(self.cfg.seed, epoch, index, view))
    }

    fn load(&self, indices: &[usize], epoch: usize) -> Result<TwoViewBatch> {
        let mut first = Vec::with_capacity(indices.len());
        let mut second = Vec::with_capacity(indices.len());
        for &index in indices {
            let frame = self.dataset.get(index)?;
            first.push(self.view(&self.views.first, &frame, epoch, index, 1));
            second.push(self.view(&self.views.second, &frame, epoch, index, 2));
        }
        Ok(TwoViewBatch {
            view1: Frame::stack(&first, &self.device)?,
            view2: Frame::stack(&second, &self.device)?,
            indices: indices.to_vec(),
        })
    }

    pub fn batches(&self, epoch: usize) -> impl Iterator<Item = Result<TwoViewBatch>> + '_ {
        let indices = shard_indices(self.dataset.len(), &self.cfg, epoch);
        let batch_size = self.cfg.batch_size;
        (0..self.num_batches()).map(move |b| {
            let end = ((b + 1) * batch_size).min(indices.len());
            self.load(&indices[b * batch_size..end], epoch)
        })
    }
}

/// In-order labelled loader for KNN banks and validation.
pub struct EvalLoader {
    dataset: Arc<dyn ImageDataset>,
    transform: Compose,
    cfg: LoaderConfig,
    device: Device,
}

impl EvalLoader {
    /// `shard` splits the dataset across ranks; otherwise every rank sees
    /// every sample.
    pub fn new(
        dataset: Arc<dyn ImageDataset>,
        transform: Compose,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        shard: bool,
        device: Device,
    ) -> Result<Self> {
        let (rank, world_size) = if shard { (rank, world_size) } else { (0, 1) };
        let cfg = LoaderConfig {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: 0,
            rank,
            world_size,
        };
        cfg.validate(dataset.len())?;
        Ok(Self {
            dataset,
            transform,
            cfg,
            device,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.cfg.num_batches(self.dataset.len())
    }

    fn load(&self, indices: &[usize]) -> Result<LabeledBatch> {
        let mut frames = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        // Eval transforms are deterministic; the RNG is never drawn from.
        let mut rng = StdRng::seed_from_u64(0);
        for &index in indices {
            let label = self
                .dataset
                .label(index)
                .ok_or(DataError::Unlabeled { index })?;
            frames.push(self.transform.apply(self.dataset.get(index)?, &mut rng));
            labels.push(label);
        }
        Ok(LabeledBatch {
            images: Frame::stack(&frames, &self.device)?,
            labels,
        })
    }

    pub fn batches(&self) -> impl Iterator<Item = Result<LabeledBatch>> + '_ {
        let indices = shard_indices(self.dataset.len(), &self.cfg, 0);
        let batch_size = self.cfg.batch_size;
        (0..self.num_batches()).map(move |b| {
            let end = ((b + 1) * batch_size).min(indices.len());
            self.load(&indices[b * batch_size..end])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::transforms::eval_transform;
    use crate::data::SyntheticDataset;
    use std::collections::HashSet;

    fn cfg(rank: usize, world_size: usize) -> LoaderConfig {
        LoaderConfig {
            batch_size: 4,
            shuffle: true,
            drop_last: true,
            seed: 11,
            rank,
            world_size,
        }
    }

    #[test]
    fn shards_are_disjoint_and_cover_everything() {
        let len = 10;
        let shards: Vec<Vec<usize>> = (0..3).map(|r| shard_indices(len, &cfg(r, 3), 2)).collect();
        assert!(shards.iter().all(|s| s.len() == 4));
        let all: HashSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(all.len(), len);
        // Padding repeats two indices.
        assert_eq!(shards.iter().map(Vec::len).sum::<usize>(), 12);
    }

    #[test]
    fn epochs_reshuffle_deterministically() {
        let a = shard_indices(50, &cfg(0, 1), 0);
        assert_eq!(a, shard_indices(50, &cfg(0, 1), 0));
        assert_ne!(a, shard_indices(50, &cfg(0, 1), 1));
    }

    #[test]
    fn two_view_batches_drop_the_tail() {
        let ds = Arc::new(SyntheticDataset::new(10, 2, 12, 0));
        let loader =
            TwoViewLoader::new(ds, TwoViews::momentum(8), cfg(0, 1), Device::Cpu).unwrap();
        assert_eq!(loader.num_batches(), 2);
        let batches: Vec<TwoViewBatch> = loader.batches(0).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].view1.dims(), &[4, 3, 8, 8]);
        assert_eq!(batches[0].view2.dims(), &[4, 3, 8, 8]);
    }

    #[test]
    fn eval_loader_keeps_order_and_labels() {
        let ds = Arc::new(SyntheticDataset::new(7, 3, 10, 0));
        let loader =
            EvalLoader::new(ds, eval_transform(10, 8), 3, 0, 2, false, Device::Cpu).unwrap();
        let batches: Vec<LabeledBatch> = loader.batches().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        let labels: Vec<u32> = batches.iter().flat_map(|b| b.labels.clone()).collect();
        assert_eq!(labels, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(batches[2].images.dims(), &[1, 3, 8, 8]);
    }

    #[test]
    fn sample_seeds_separate_epochs_indices_and_views() {
        let mut seen = HashSet::new();
        for epoch in 0..3 {
            for index in 0..3 {
                for view in 1..=2 {
                    assert!(seen.insert(derive_seed(5, &[epoch, index, view])));
                }
            }
        }
        let draw = |rng: &mut StdRng| rng.gen::<u64>();
        assert_eq!(draw(&mut sample_rng(5, 1, 2, 1)), draw(&mut sample_rng(5, 1, 2, 1)));
        assert_ne!(draw(&mut sample_rng(5, 1, 2, 1)), draw(&mut sample_rng(6, 1, 2, 1)));
    }

    #[test]
    fn views_do_not_depend_on_the_loading_rank() {
        let ds: Arc<dyn ImageDataset> = Arc::new(SyntheticDataset::new(8, 2, 12, 0));
        let single = TwoViewLoader::new(ds.clone(), TwoViews::momentum(8), cfg(0, 1), Device::Cpu).unwrap();
        let rank1 = TwoViewLoader::new(ds, TwoViews::momentum(8), cfg(1, 2), Device::Cpu).unwrap();
        let frame = SyntheticDataset::new(8, 2, 12, 0).get(3).unwrap();
        let a = single.view(&single.views.first, &frame, 4, 3, 1);
        let b = rank1.view(&rank1.views.first, &frame, 4, 3, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let ds = Arc::new(SyntheticDataset::new(4, 2, 8, 0));
        let bad = LoaderConfig {
            batch_size: 0,
            ..cfg(0, 1)
        };
        assert!(matches!(
            TwoViewLoader::new(ds, TwoViews::simclr(8), bad, Device::Cpu),
            Err(DataError::InvalidConfig(_))
        ));
    }
}
