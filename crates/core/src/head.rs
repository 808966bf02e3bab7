//! Projection and prediction heads on top of the backbone.
//!
//! [`EmbeddingNet`] bundles a [`VisionTransformer`] with a projector and an
//! optional predictor. The projector is either a single MLP applied to the
//! final representation, or one MLP per block applied to every block's
//! pooled output (intermediate supervision).

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::VitConfig;
use crate::layers::{batch_norm_1d, linear_normal, BatchNorm1d};
use crate::models::VisionTransformer;

pub const BACKBONE: &str = "backbone";
pub const PROJECTOR: &str = "projector";
pub const PREDICTOR: &str = "predictor";

const HEAD_BN_EPS: f64 = 1e-5;

/// Head dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadConfig {
    /// Output dimension of projector and predictor.
    pub out_dim: usize,
    /// Hidden dimension of every head MLP.
    pub hidden_dim: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            out_dim: 512,
            hidden_dim: 4096,
        }
    }
}

/// Linear -> BatchNorm -> ReLU -> Linear.
pub struct ProjectionMlp {
    fc1: Linear,
    bn: BatchNorm1d,
    fc2: Linear,
}

impl ProjectionMlp {
    pub fn new(in_dim: usize, hidden_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear_normal(in_dim, hidden_dim, vb.pp("fc1"))?,
            bn: batch_norm_1d(hidden_dim, HEAD_BN_EPS, vb.pp("bn"))?,
            fc2: linear_normal(hidden_dim, out_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for ProjectionMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.bn.forward(&self.fc1.forward(xs)?)?.relu()?;
        self.fc2.forward(&hidden)
    }
}

pub enum Projector {
    Single(ProjectionMlp),
    PerLayer(Vec<ProjectionMlp>),
}

/// Backbone plus heads: the trainable unit of both student and teacher.
pub struct EmbeddingNet {
    backbone: VisionTransformer,
    projector: Projector,
    predictor: Option<ProjectionMlp>,
}

impl EmbeddingNet {
    pub fn new(
        cfg: &VitConfig,
        head: &HeadConfig,
        intermediate: bool,
        prediction: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let backbone = VisionTransformer::new(cfg, vb.pp(BACKBONE))?;
        let dim = cfg.embed_dim;

        let vb_proj = vb.pp(PROJECTOR);
        let projector = if intermediate {
            let heads = (0..cfg.depth)
                .map(|i| ProjectionMlp::new(dim, head.hidden_dim, head.out_dim, vb_proj.pp(i)))
                .collect::<Result<Vec<_>>>()?;
            Projector::PerLayer(heads)
        } else {
            Projector::Single(ProjectionMlp::new(dim, head.hidden_dim, head.out_dim, vb_proj)?)
        };

        let predictor = if prediction {
            Some(ProjectionMlp::new(
                head.out_dim,
                head.hidden_dim,
                head.out_dim,
                vb.pp(PREDICTOR),
            )?)
        } else {
            None
        };

        Ok(Self {
            backbone,
            projector,
            predictor,
        })
    }

    /// Projected embeddings.
    ///
    /// Single projector: `[b, out_dim]`. Per-layer projector:
    /// `[depth * b, out_dim]`, layer-major, final layer last.
    pub fn forward_t(&self, pixel_values: &Tensor, train: bool) -> Result<Tensor> {
        match &self.projector {
            Projector::Single(mlp) => mlp.forward(&self.backbone.forward_t(pixel_values, train)?),
            Projector::PerLayer(mlps) => {
                let layers = self.backbone.forward_all_layers(pixel_values, train)?;
                let projected = layers
                    .iter()
                    .zip(mlps)
                    .map(|(xs, mlp)| mlp.forward(xs))
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&projected, 0)
            }
        }
    }

    /// Apply the predictor; identity when the net has none.
    pub fn predict(&self, projections: &Tensor) -> Result<Tensor> {
        match &self.predictor {
            Some(mlp) => mlp.forward(projections),
            None => Ok(projections.clone()),
        }
    }

    /// Backbone representation used for evaluation, `[b, embed_dim]`.
    pub fn representation(&self, pixel_values: &Tensor) -> Result<Tensor> {
        Ok(self.backbone.forward_t(pixel_values, false)?.detach())
    }

    pub fn backbone(&self) -> &VisionTransformer {
        &self.backbone
    }

    pub fn is_intermediate(&self) -> bool {
        matches!(self.projector, Projector::PerLayer(_))
    }

    pub fn has_predictor(&self) -> bool {
        self.predictor.is_some()
    }

    pub fn depth(&self) -> usize {
        self.backbone.depth()
    }

    /// Full parameter-name prefixes excluded from optimisation.
    pub fn frozen_prefixes(&self) -> Vec<String> {
        self.backbone
            .frozen_prefixes()
            .into_iter()
            .map(|p| format!("{BACKBONE}.{p}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_head_config, tiny_vit_config};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn single_projector_output_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = EmbeddingNet::new(&tiny_vit_config(), &tiny_head_config(), false, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (4, 3, 16, 16), &Device::Cpu).unwrap();
        let z = net.forward_t(&x, true).unwrap();
        assert_eq!(z.dims(), &[4, 8]);
        assert_eq!(net.predict(&z).unwrap().dims(), &[4, 8]);
        assert_eq!(net.representation(&x).unwrap().dims(), &[4, 16]);
        assert!(!net.is_intermediate());
        assert!(net.has_predictor());
    }

    #[test]
    fn per_layer_projector_stacks_layers() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = EmbeddingNet::new(&tiny_vit_config(), &tiny_head_config(), true, false, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (4, 3, 16, 16), &Device::Cpu).unwrap();
        let z = net.forward_t(&x, true).unwrap();
        assert_eq!(z.dims(), &[12, 8]);
        assert!(net.is_intermediate());

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "projector.2.fc1.weight"));
        assert!(!names.iter().any(|n| n.starts_with("predictor")));
    }

    #[test]
    fn predictor_absent_is_identity() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = EmbeddingNet::new(&tiny_vit_config(), &tiny_head_config(), false, false, vb).unwrap();
        let z = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let p: Vec<Vec<f32>> = net.predict(&z).unwrap().to_vec2().unwrap();
        assert_eq!(p, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(net.frozen_prefixes(), vec!["backbone.patch_embed.".to_string()]);
    }
}
