//! Contrastive objectives.
//!
//! All losses take row-wise embeddings, L2-normalise them and score every
//! anchor against a candidate set with a temperature-scaled dot product.

use candle_core::{DType, Device, Tensor, D};
use thiserror::Error;

/// Temperature of the cross-batch student/teacher objective.
pub const MOMENTUM_TEMPERATURE: f64 = 0.2;
/// Temperature of the self-similarity objective.
pub const SIMCLR_TEMPERATURE: f64 = 0.1;

const NORM_EPS: f64 = 1e-24;

#[derive(Error, Debug)]
pub enum LossError {
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, LossError>;

/// Scalar loss plus the logits and targets it was computed from.
#[derive(Debug, Clone)]
pub struct InfoNceOutput {
    pub loss: Tensor,
    pub logits: Tensor,
    pub labels: Vec<u32>,
}

/// Row-wise L2 normalisation.
pub fn l2_normalize(xs: &Tensor) -> candle_core::Result<Tensor> {
    let norm = (xs.sqr()?.sum_keepdim(D::Minus1)? + NORM_EPS)?.sqrt()?;
    xs.broadcast_div(&norm)
}

fn check_temperature(temperature: f64) -> Result<()> {
    if !temperature.is_finite() || temperature <= 0.0 {
        return Err(LossError::InvalidArgument(format!(
            "temperature must be > 0, got {temperature}"
        )));
    }
    Ok(())
}

fn check_feature_dims(a: &Tensor, b: &Tensor) -> Result<(usize, usize)> {
    let (rows_a, dim_a) = a.dims2()?;
    let (rows_b, dim_b) = b.dims2()?;
    if dim_a != dim_b {
        return Err(LossError::Shape(format!(
            "feature dim mismatch (anchors={dim_a}, candidates={dim_b})"
        )));
    }
    if rows_a == 0 || rows_b == 0 {
        return Err(LossError::InvalidArgument(
            "contrastive batches must be non-empty".to_string(),
        ));
    }
    Ok((rows_a, rows_b))
}

fn labels_tensor(labels: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(labels, labels.len(), device)?)
}

fn scored_cross_entropy(
    anchors: &Tensor,
    candidates: &Tensor,
    labels: Vec<u32>,
    temperature: f64,
) -> Result<InfoNceOutput> {
    let logits = (l2_normalize(anchors)?.matmul(&l2_normalize(candidates)?.t()?)? / temperature)?;
    let targets = labels_tensor(&labels, anchors.device())?;
    let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
    Ok(InfoNceOutput {
        loss,
        logits,
        labels,
    })
}

/// Cross-batch InfoNCE between student rows and (gathered) teacher rows.
///
/// `student` is `[b, d]` for this worker, `teacher` is `[b * world, d]`
/// gathered in rank order. The positive of student row `i` is teacher row
/// `i + b * rank`. The cross entropy is scaled by `2 * temperature`.
pub fn cross_batch_info_nce(
    student: &Tensor,
    teacher: &Tensor,
    temperature: f64,
    rank: usize,
) -> Result<InfoNceOutput> {
    layerwise_info_nce(student, teacher, 1, temperature, rank)
}

/// Cross-batch InfoNCE where the student rows stack `depth` layers
/// layer-major (`[depth * b, d]`), all scored against the same teacher rows.
pub fn layerwise_info_nce(
    student: &Tensor,
    teacher: &Tensor,
    depth: usize,
    temperature: f64,
    rank: usize,
) -> Result<InfoNceOutput> {
    check_temperature(temperature)?;
    let (rows, teacher_rows) = check_feature_dims(student, teacher)?;
    if depth == 0 || rows % depth != 0 {
        return Err(LossError::Shape(format!(
            "{rows} student rows do not split into {depth} layers"
        )));
    }
    let batch = rows / depth;
    let offset = batch * rank;
    if offset + batch > teacher_rows {
        return Err(LossError::Shape(format!(
            "rank {rank} with batch {batch} needs {} teacher rows, got {teacher_rows}",
            offset + batch
        )));
    }

    let labels: Vec<u32> = (0..depth)
        .flat_map(|_| (0..batch).map(move |i| (i + offset) as u32))
        .collect();

    let mut out = scored_cross_entropy(student, teacher, labels, temperature)?;
    out.loss = out.loss.affine(2.0 * temperature, 0.0)?;
    Ok(out)
}

/// Self-similarity InfoNCE over two concatenated views `[2b, d]`.
///
/// Row `i` and row `(i + b) mod 2b` are views of the same image. Each row is
/// scored against every other row; the positive sits at logit column 0 and
/// the `2b - 2` negatives follow in their original order.
pub fn self_similarity_info_nce(features: &Tensor, temperature: f64) -> Result<InfoNceOutput> {
    check_temperature(temperature)?;
    let (rows, _) = features.dims2()?;
    if rows < 2 || rows % 2 != 0 {
        return Err(LossError::Shape(format!(
            "self-similarity needs an even number of rows >= 2, got {rows}"
        )));
    }
    let half = rows / 2;

    let mut index = Vec::with_capacity(rows * (rows - 1));
    for i in 0..rows {
        let positive = (i + half) % rows;
        index.push(positive as u32);
        index.extend((0..rows).filter(|&j| j != i && j != positive).map(|j| j as u32));
    }
    let index = Tensor::from_vec(index, (rows, rows - 1), features.device())?;

    let normed = l2_normalize(features)?;
    let similarity = normed.matmul(&normed.t()?)?;
    let logits = (similarity.gather(&index, 1)? / temperature)?;

    let labels = vec![0u32; rows];
    let targets = labels_tensor(&labels, features.device())?;
    let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
    Ok(InfoNceOutput {
        loss,
        logits,
        labels,
    })
}

/// Intermediate-layer InfoNCE against a detached final output.
///
/// `layers` is `[depth * b, d]` layer-major, `output` is `[b, d]`; row `i` of
/// every layer is positive with row `i` of the output.
pub fn intermediate_info_nce(
    layers: &Tensor,
    output: &Tensor,
    depth: usize,
    temperature: f64,
) -> Result<InfoNceOutput> {
    check_temperature(temperature)?;
    let (rows, out_rows) = check_feature_dims(layers, output)?;
    if depth == 0 || rows != depth * out_rows {
        return Err(LossError::Shape(format!(
            "{rows} layer rows do not match {depth} layers of {out_rows}"
        )));
    }
    let labels: Vec<u32> = (0..depth)
        .flat_map(|_| (0..out_rows).map(|i| i as u32))
        .collect();
    scored_cross_entropy(layers, &output.detach(), labels, temperature)
}

/// BYOL regression loss `mean(2 - 2 cos(x, y))`.
pub fn regression_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let cos = mean_cosine_terms(x, y)?;
    Ok(cos.affine(-2.0, 2.0)?.mean_all()?)
}

/// Mean cosine similarity between matching rows.
pub fn mean_cosine(x: &Tensor, y: &Tensor) -> Result<f32> {
    Ok(mean_cosine_terms(x, y)?
        .mean_all()?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?)
}

fn mean_cosine_terms(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.dims() != y.dims() {
        return Err(LossError::Shape(format!(
            "cosine operands differ: {:?} vs {:?}",
            x.dims(),
            y.dims()
        )));
    }
    Ok((l2_normalize(x)? * l2_normalize(y)?)?.sum(D::Minus1)?)
}

/// Scalar value of a loss tensor.
pub fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn randn(rows: usize, dim: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (rows, dim), &Device::Cpu).unwrap()
    }

    #[test]
    fn cross_batch_is_scale_invariant() {
        let s = randn(6, 16);
        let t = randn(6, 16);
        let base = scalar(&cross_batch_info_nce(&s, &t, 0.2, 0).unwrap().loss).unwrap();
        let scaled = scalar(
            &cross_batch_info_nce(&(&s * 7.5).unwrap(), &(&t * 0.01).unwrap(), 0.2, 0)
                .unwrap()
                .loss,
        )
        .unwrap();
        assert!((base - scaled).abs() < 1e-4, "{base} vs {scaled}");
    }

    #[test]
    fn cross_batch_labels_offset_by_rank() {
        let s = randn(3, 8);
        let t = randn(9, 8);
        let out = cross_batch_info_nce(&s, &t, 0.2, 2).unwrap();
        assert_eq!(out.labels, vec![6, 7, 8]);
        assert_eq!(out.logits.dims(), &[3, 9]);

        let err = cross_batch_info_nce(&s, &randn(6, 8), 0.2, 2).unwrap_err();
        assert!(matches!(err, LossError::Shape(_)));
    }

    #[test]
    fn cross_batch_is_scaled_by_two_tau() {
        // Orthogonal one-hot rows: logits are 1/τ on the diagonal, 0 elsewhere.
        let eye = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let tau = 0.5;
        let loss = scalar(&cross_batch_info_nce(&eye, &eye, tau, 0).unwrap().loss).unwrap();
        let ce = -((2f32).exp() / ((2f32).exp() + 1.0)).ln();
        assert!((loss - 2.0 * tau as f32 * ce).abs() < 1e-5);
    }

    #[test]
    fn layerwise_repeats_labels_per_layer() {
        let s = randn(6, 4);
        let t = randn(2, 4);
        let out = layerwise_info_nce(&s, &t, 3, 0.2, 0).unwrap();
        assert_eq!(out.labels, vec![0, 1, 0, 1, 0, 1]);

        let err = layerwise_info_nce(&randn(7, 4), &t, 3, 0.2, 0).unwrap_err();
        assert!(matches!(err, LossError::Shape(_)));
    }

    #[test]
    fn identical_views_give_unit_positive_similarity() {
        let view = randn(4, 12);
        let features = Tensor::cat(&[&view, &view], 0).unwrap();
        let tau = 0.1;
        let out = self_similarity_info_nce(&features, tau).unwrap();
        assert_eq!(out.logits.dims(), &[8, 7]);
        let logits: Vec<Vec<f32>> = out.logits.to_vec2().unwrap();
        for row in logits {
            assert!((row[0] * tau as f32 - 1.0).abs() < 1e-5);
        }
        assert_eq!(out.labels, vec![0; 8]);
    }

    #[test]
    fn self_similarity_rejects_odd_rows() {
        let err = self_similarity_info_nce(&randn(5, 4), 0.1).unwrap_err();
        assert!(matches!(err, LossError::Shape(_)));
    }

    #[test]
    fn intermediate_targets_do_not_receive_gradients() {
        let layers = candle_core::Var::from_tensor(&randn(4, 8)).unwrap();
        let output = candle_core::Var::from_tensor(&randn(2, 8)).unwrap();
        let out = intermediate_info_nce(layers.as_tensor(), output.as_tensor(), 2, 0.1).unwrap();
        assert_eq!(out.labels, vec![0, 1, 0, 1]);

        let grads = out.loss.backward().unwrap();
        assert!(grads.get(layers.as_tensor()).is_some());
        assert!(grads.get(output.as_tensor()).is_none());
    }

    #[test]
    fn regression_loss_is_zero_for_parallel_vectors() {
        let x = randn(3, 5);
        let y = (&x * 3.0).unwrap();
        let loss = scalar(&regression_loss(&x, &y).unwrap()).unwrap();
        assert!(loss.abs() < 1e-5);
        assert!((mean_cosine(&x, &y).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_non_positive_temperature() {
        let x = randn(2, 4);
        assert!(matches!(
            cross_batch_info_nce(&x, &x, 0.0, 0),
            Err(LossError::InvalidArgument(_))
        ));
    }
}
