use candle_core::{Device, Tensor};

use super::tiny_config::TINY_IMAGE;
use crate::data::{open_splits, DataSplits, DatasetKind, SyntheticSizes, TwoViewBatch};

/// Two independent standard-normal views of `batch` tiny images.
pub fn random_two_view_batch(batch: usize) -> candle_core::Result<TwoViewBatch> {
    let shape = (batch, 3, TINY_IMAGE, TINY_IMAGE);
    Ok(TwoViewBatch {
        view1: Tensor::randn(0f32, 1.0, shape, &Device::Cpu)?,
        view2: Tensor::randn(0f32, 1.0, shape, &Device::Cpu)?,
        indices: (0..batch).collect(),
    })
}

/// Synthetic splits of tiny images.
pub fn synthetic_splits(train: usize, val: usize, num_classes: usize) -> DataSplits {
    let sizes = SyntheticSizes {
        train,
        val,
        num_classes,
    };
    match open_splits(
        DatasetKind::Synthetic,
        std::path::Path::new("."),
        TINY_IMAGE,
        sizes,
        7,
    ) {
        Ok(splits) => splits,
        Err(e) => panic!("synthetic splits never touch the filesystem: {e}"),
    }
}
