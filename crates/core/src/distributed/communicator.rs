//! Collective operations over model tensors.
//!
//! Data-parallel training needs four collectives: all-gather of embeddings
//! before the loss and before KNN evaluation, all-reduce of gradients,
//! broadcast of the initial weights, and a barrier.

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Sum / world_size.
    Average,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
}

impl ReduceOp {
    /// Fold the contributions of every rank, in rank order.
    pub(crate) fn reduce(&self, parts: &[Tensor]) -> Result<Tensor> {
        let (first, rest) = parts.split_first().ok_or(DistributedError::EmptyWorld)?;
        let mut acc = first.clone();
        for part in rest {
            check_same_shape(first, part)?;
            acc = match self {
                ReduceOp::Sum | ReduceOp::Average => (acc + part)?,
                ReduceOp::Min => acc.minimum(part)?,
                ReduceOp::Max => acc.maximum(part)?,
            };
        }
        if *self == ReduceOp::Average && parts.len() > 1 {
            acc = (acc / parts.len() as f64)?;
        }
        Ok(acc)
    }
}

fn check_same_shape(expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.dims() != actual.dims() {
        return Err(DistributedError::ShapeMismatch {
            expected: expected.dims().to_vec(),
            actual: actual.dims().to_vec(),
        });
    }
    Ok(())
}

/// Concatenate the contributions of every rank along `dim`. All other
/// dimensions must agree.
pub(crate) fn concat(parts: &[Tensor], dim: usize) -> Result<Tensor> {
    let first = parts.first().ok_or(DistributedError::EmptyWorld)?;
    for part in &parts[1..] {
        let same_rank = first.rank() == part.rank();
        let same_other_dims = same_rank
            && first
                .dims()
                .iter()
                .zip(part.dims())
                .enumerate()
                .all(|(i, (a, b))| i == dim || a == b);
        if !same_other_dims {
            return Err(DistributedError::ShapeMismatch {
                expected: first.dims().to_vec(),
                actual: part.dims().to_vec(),
            });
        }
    }
    Ok(Tensor::cat(parts, dim)?)
}

/// Trait for worker-to-worker communication.
///
/// Every rank must issue the same collectives in the same order; a collective
/// blocks until all ranks of the group have entered it.
pub trait DeviceCommunicator: Send + Sync {
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: concatenate tensors from all ranks along `gather_dim`,
    /// in rank order.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...] (if gather_dim=0)
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Broadcast: every rank receives the tensor of `src_rank`.
    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;

    fn rank(&self) -> usize {
        self.process_group().rank()
    }

    fn world_size(&self) -> usize {
        self.process_group().world_size()
    }
}

/// Communicator for a single worker: every collective is the identity.
#[derive(Debug, Clone, Default)]
pub struct LocalCommunicator {
    process_group: LocalProcessGroup,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self {
            process_group: LocalProcessGroup::new(),
        }
    }
}

impl DeviceCommunicator for LocalCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _gather_dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        if src_rank != 0 {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size: 1,
            });
        }
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
