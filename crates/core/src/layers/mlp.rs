use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Linear layer with xavier-uniform weights and zero bias.
pub fn linear_xavier(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    linear_uniform(in_dim, out_dim, xavier_bound(in_dim, out_dim), bias, vb)
}

/// Linear layer with weights drawn from `U(-bound, bound)` and zero bias.
pub fn linear_uniform(
    in_dim: usize,
    out_dim: usize,
    bound: f64,
    bias: bool,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Linear layer with `N(0, 0.02)` weights and zero bias, used by the heads.
pub fn linear_normal(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

pub fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Transformer feed-forward block: Linear -> GELU -> Linear.
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    drop: f32,
}

impl Mlp {
    pub fn new(dim: usize, hidden_dim: usize, drop: f32, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear_xavier(dim, hidden_dim, true, vb.pp("fc1"))?;
        let fc2 = linear_xavier(hidden_dim, dim, true, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2, drop })
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?.gelu_erf()?;
        let hidden = dropout(&hidden, self.drop, train)?;
        let out = self.fc2.forward(&hidden)?;
        dropout(&out, self.drop, train)
    }
}

pub(crate) fn dropout(xs: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(xs, p)
    } else {
        Ok(xs.clone())
    }
}
