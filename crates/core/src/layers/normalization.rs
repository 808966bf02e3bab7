use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// LayerNorm over the last dimension.
///
/// Drop-in replacement for `candle_nn::LayerNorm` built only from primitive
/// tensor ops, so gradients flow through it during training.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Create a LayerNorm with weight 1 and bias 0.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Batch normalisation over `[batch, features]` using the statistics of the
/// current batch.
///
/// Only used inside projection heads, which are evaluated in training mode.
#[derive(Clone, Debug)]
pub struct BatchNorm1d {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl Module for BatchNorm1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(0)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(0)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

pub fn batch_norm_1d(size: usize, eps: f64, vb: VarBuilder) -> Result<BatchNorm1d> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(BatchNorm1d { weight, bias, eps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn layer_norm_output_is_standardized() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = layer_norm(32, 1e-6, vb).unwrap();

        let input = (Tensor::randn(0.0f32, 3.0, (2, 5, 32), &device).unwrap() + 7.0).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 5, 32]);

        let mean: Vec<Vec<f32>> = output.mean(D::Minus1).unwrap().to_vec2().unwrap();
        for row in mean.iter().flatten() {
            assert!(row.abs() < 1e-4, "mean {row}");
        }
        let var: Vec<Vec<f32>> = output.sqr().unwrap().mean(D::Minus1).unwrap().to_vec2().unwrap();
        for row in var.iter().flatten() {
            assert!((row - 1.0).abs() < 1e-3, "var {row}");
        }
    }

    #[test]
    fn layer_norm_matches_candle_reference() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[1.0f32, 2.0, 0.5, 1.0], &device).unwrap();
        let bias = Tensor::new(&[0.0f32, 0.1, -0.1, 0.0], &device).unwrap();
        let ours = LayerNorm::new(weight.clone(), bias.clone(), 1e-5);
        let reference = candle_nn::LayerNorm::new(weight, bias, 1e-5);

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [0.5, -0.5, 2.0, 0.0]], &device).unwrap();
        let a: Vec<Vec<f32>> = ours.forward(&x).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = reference.forward(&x).unwrap().to_vec2().unwrap();
        for (ra, rb) in a.iter().zip(b.iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert!((va - vb).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn layer_norm_propagates_gradients() {
        let device = Device::Cpu;
        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (3, 8), &device).unwrap()).unwrap();
        let norm = LayerNorm::new(
            Tensor::ones(8, DType::F32, &device).unwrap(),
            Tensor::zeros(8, DType::F32, &device).unwrap(),
            1e-6,
        );
        let weights = Tensor::arange(0f32, 8.0, &device).unwrap();
        let loss = norm
            .forward(x.as_tensor())
            .unwrap()
            .broadcast_mul(&weights)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        let gx = grads.get(x.as_tensor()).expect("gradient for input");
        assert_eq!(gx.dims(), &[3, 8]);
    }

    #[test]
    fn batch_norm_normalizes_columns() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bn = batch_norm_1d(4, 1e-5, vb).unwrap();

        let x = Tensor::new(
            &[[1.0f32, 10.0, -3.0, 0.0], [3.0, 20.0, -1.0, 0.0]],
            &device,
        )
        .unwrap();
        let y: Vec<Vec<f32>> = bn.forward(&x).unwrap().to_vec2().unwrap();
        assert!((y[0][0] + 1.0).abs() < 1e-3);
        assert!((y[1][0] - 1.0).abs() < 1e-3);
        assert!((y[0][1] + 1.0).abs() < 1e-3);
        // Constant column collapses to the bias.
        assert!(y[0][3].abs() < 1e-6);
    }
}
