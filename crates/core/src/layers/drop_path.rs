use candle_core::{Result, Tensor};
use rand::Rng;

/// Stochastic depth: zeroes the whole residual branch of a sample with
/// probability `drop_prob` and rescales survivors by `1 / keep_prob`.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f32,
}

impl DropPath {
    pub fn new(drop_prob: f32) -> Self {
        Self { drop_prob }
    }

    pub fn drop_prob(&self) -> f32 {
        self.drop_prob
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob <= 0.0 {
            return Ok(xs.clone());
        }
        let keep_prob = 1.0 - self.drop_prob;
        let batch = xs.dim(0)?;
        let mut rng = rand::thread_rng();
        let mask: Vec<f32> = (0..batch)
            .map(|_| {
                if rng.gen::<f32>() < keep_prob {
                    1.0 / keep_prob
                } else {
                    0.0
                }
            })
            .collect();

        // [batch, 1, 1, ...] so the mask broadcasts over every other axis.
        let mut shape = vec![1usize; xs.rank()];
        shape[0] = batch;
        let mask = Tensor::from_vec(mask, shape, xs.device())?.to_dtype(xs.dtype())?;
        xs.broadcast_mul(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn eval_is_identity() {
        let x = Tensor::ones((3, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let y = DropPath::new(0.9).forward_t(&x, false).unwrap();
        let total: f32 = y.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 60.0);
    }

    #[test]
    fn drops_whole_samples() {
        let x = Tensor::ones((64, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let y = DropPath::new(0.5).forward_t(&x, true).unwrap();
        let rows: Vec<Vec<Vec<f32>>> = y.to_vec3().unwrap();
        for sample in rows {
            let first = sample[0][0];
            assert!(first == 0.0 || (first - 2.0).abs() < 1e-6);
            assert!(sample.iter().flatten().all(|v| *v == first));
        }
    }
}
