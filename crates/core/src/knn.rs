//! Weighted k-nearest-neighbour evaluation of frozen representations.
//!
//! A [`FeatureBank`] holds the L2-normalised embeddings of a labelled
//! reference set, gathered from every worker. Each query votes with its `k`
//! most similar bank entries, weighted by `exp(similarity / temperature)`.

use candle_core::{DType, Tensor};
use thiserror::Error;

use crate::distributed::{DeviceCommunicator, DistributedError};
use crate::loss::l2_normalize;

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_TEMPERATURE: f64 = 0.07;

#[derive(Error, Debug)]
pub enum KnnError {
    #[error("feature bank is empty")]
    EmptyBank,

    #[error("validation set is empty")]
    EmptyValidation,

    #[error("{features} feature rows but {labels} labels")]
    LabelCount { features: usize, labels: usize },

    #[error("label {label} is outside {num_classes} classes")]
    LabelOutOfRange { label: u32, num_classes: usize },

    #[error("query dim {query} does not match bank dim {bank}")]
    DimMismatch { query: usize, bank: usize },

    #[error("k must be > 0")]
    ZeroK,

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, KnnError>;

/// Normalised reference embeddings with their labels.
#[derive(Debug, Clone)]
pub struct FeatureBank {
    features: Tensor,
    labels: Vec<u32>,
}

impl FeatureBank {
    /// Build a bank from raw `[n, d]` features.
    pub fn new(features: &Tensor, labels: Vec<u32>) -> Result<Self> {
        let (rows, _) = features.dims2()?;
        if rows != labels.len() {
            return Err(KnnError::LabelCount {
                features: rows,
                labels: labels.len(),
            });
        }
        if rows == 0 {
            return Err(KnnError::EmptyBank);
        }
        let features = l2_normalize(&features.detach().to_dtype(DType::F32)?)?;
        Ok(Self { features, labels })
    }

    /// Gather the local shards of every worker, in rank order, into one bank.
    pub fn gather(
        local_features: &Tensor,
        local_labels: &[u32],
        comm: &dyn DeviceCommunicator,
    ) -> Result<Self> {
        let labels = Tensor::from_slice(local_labels, local_labels.len(), local_features.device())?;
        let features = comm.all_gather(&local_features.detach(), 0)?;
        let labels = comm.all_gather(&labels, 0)?.to_vec1::<u32>()?;
        Self::new(&features, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.features.dims().get(1).copied().unwrap_or(0)
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    /// `max(label) + 1`.
    pub fn inferred_num_classes(&self) -> usize {
        self.labels.iter().max().map_or(0, |m| *m as usize + 1)
    }
}

/// Running top-1/top-5 counts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KnnAccuracy {
    pub top1_correct: usize,
    pub top5_correct: usize,
    pub total: usize,
}

impl KnnAccuracy {
    /// Top-1 and top-5 accuracy in percent.
    pub fn percentages(&self) -> Result<(f64, f64)> {
        if self.total == 0 {
            return Err(KnnError::EmptyValidation);
        }
        let total = self.total as f64;
        Ok((
            self.top1_correct as f64 * 100.0 / total,
            self.top5_correct as f64 * 100.0 / total,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnnClassifier {
    pub k: usize,
    pub temperature: f64,
    /// Defaults to the bank's inferred class count.
    pub num_classes: Option<usize>,
}

impl Default for KnnClassifier {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            temperature: DEFAULT_TEMPERATURE,
            num_classes: None,
        }
    }
}

impl KnnClassifier {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }

    fn num_classes(&self, bank: &FeatureBank) -> usize {
        self.num_classes
            .unwrap_or_else(|| bank.inferred_num_classes())
    }

    /// Classes ranked by weighted vote, one list per query row.
    pub fn rank_classes(&self, bank: &FeatureBank, queries: &Tensor) -> Result<Vec<Vec<usize>>> {
        if self.k == 0 {
            return Err(KnnError::ZeroK);
        }
        if bank.is_empty() {
            return Err(KnnError::EmptyBank);
        }
        let (_, dim) = queries.dims2()?;
        if dim != bank.dim() {
            return Err(KnnError::DimMismatch {
                query: dim,
                bank: bank.dim(),
            });
        }
        let num_classes = self.num_classes(bank);
        if let Some(&label) = bank.labels.iter().find(|l| **l as usize >= num_classes) {
            return Err(KnnError::LabelOutOfRange { label, num_classes });
        }

        let queries = l2_normalize(&queries.detach().to_dtype(DType::F32)?)?
            .to_device(bank.features.device())?;
        let similarity: Vec<Vec<f32>> = queries.matmul(&bank.features.t()?)?.to_vec2()?;
        let k = self.k.min(bank.len());

        let ranked = similarity
            .iter()
            .map(|row| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

                let mut votes = vec![0f64; num_classes];
                for &j in &order[..k] {
                    votes[bank.labels[j] as usize] += (row[j] as f64 / self.temperature).exp();
                }
                let mut classes: Vec<usize> = (0..num_classes).collect();
                classes.sort_by(|&a, &b| votes[b].total_cmp(&votes[a]));
                classes
            })
            .collect();
        Ok(ranked)
    }

    /// Score one batch of queries into `acc`.
    pub fn accumulate(
        &self,
        bank: &FeatureBank,
        queries: &Tensor,
        targets: &[u32],
        acc: &mut KnnAccuracy,
    ) -> Result<()> {
        let ranked = self.rank_classes(bank, queries)?;
        if ranked.len() != targets.len() {
            return Err(KnnError::LabelCount {
                features: ranked.len(),
                labels: targets.len(),
            });
        }
        for (classes, &target) in ranked.iter().zip(targets) {
            let target = target as usize;
            if classes.first() == Some(&target) {
                acc.top1_correct += 1;
            }
            if classes.iter().take(5).any(|&c| c == target) {
                acc.top5_correct += 1;
            }
        }
        acc.total += targets.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;
    use candle_core::Device;

    fn features(rows: &[[f32; 3]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn duplicate_queries_score_perfectly() {
        let bank_x = Tensor::randn(0f32, 1.0, (40, 8), &Device::Cpu).unwrap();
        let labels: Vec<u32> = (0..40).map(|i| i % 7).collect();
        let bank = FeatureBank::new(&bank_x, labels.clone()).unwrap();

        let knn = KnnClassifier {
            k: 1,
            ..KnnClassifier::default()
        };
        let mut acc = KnnAccuracy::default();
        knn.accumulate(&bank, &bank_x, &labels, &mut acc).unwrap();
        assert_eq!(acc.percentages().unwrap(), (100.0, 100.0));
    }

    #[test]
    fn weighted_votes_beat_majority() {
        // Two distant neighbours of class 1 are outvoted by one exact match of
        // class 0 at a low temperature.
        let bank = FeatureBank::new(
            &features(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
            vec![0, 1, 1],
        )
        .unwrap();
        let knn = KnnClassifier::new(3);
        let ranked = knn
            .rank_classes(&bank, &features(&[[1.0, 0.1, 0.1]]))
            .unwrap();
        assert_eq!(ranked, vec![vec![0, 1]]);
    }

    #[test]
    fn k_is_clamped_to_bank_size() {
        let bank = FeatureBank::new(&features(&[[1.0, 0.0, 0.0]]), vec![2]).unwrap();
        let ranked = KnnClassifier::default()
            .rank_classes(&bank, &features(&[[0.5, 0.5, 0.0]]))
            .unwrap();
        assert_eq!(ranked[0][0], 2);
        assert_eq!(ranked[0].len(), 3);
    }

    #[test]
    fn empty_validation_is_an_error() {
        assert!(matches!(
            KnnAccuracy::default().percentages(),
            Err(KnnError::EmptyValidation)
        ));
        assert!(matches!(
            FeatureBank::new(&features(&[[1.0, 0.0, 0.0]]), vec![]),
            Err(KnnError::LabelCount { .. })
        ));
    }

    #[test]
    fn configured_classes_must_cover_labels() {
        let bank = FeatureBank::new(&features(&[[1.0, 0.0, 0.0]]), vec![4]).unwrap();
        let knn = KnnClassifier {
            num_classes: Some(3),
            ..KnnClassifier::default()
        };
        assert!(matches!(
            knn.rank_classes(&bank, &features(&[[1.0, 0.0, 0.0]])),
            Err(KnnError::LabelOutOfRange { label: 4, .. })
        ));
    }

    #[test]
    fn gather_on_single_worker_keeps_rows() {
        let comm = LocalCommunicator::new();
        let bank = FeatureBank::gather(
            &features(&[[3.0, 0.0, 4.0], [0.0, 2.0, 0.0]]),
            &[1, 0],
            &comm,
        )
        .unwrap();
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.inferred_num_classes(), 2);
        let first: Vec<Vec<f32>> = bank.features().to_vec2().unwrap();
        assert!((first[0][0] - 0.6).abs() < 1e-6);
        assert!((first[0][2] - 0.8).abs() < 1e-6);
    }
}
