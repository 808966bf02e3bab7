//! Vision Transformer backbone for self-supervised pre-training.
//!
//! Images are cut into non-overlapping patches by a strided convolution,
//! prefixed with a CLS token (and a distillation token for DeiT variants),
//! offset by a fixed 2D sin-cos encoding and passed through a stack of
//! pre-norm transformer blocks. Every block owns an output LayerNorm so that
//! intermediate layers can be supervised and pooled the same way as the
//! final one.

use candle_core::{bail, DType, Device, IndexOp, Module, ModuleT, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, VarBuilder};

use crate::config::{Pooling, VitConfig};
use crate::layers::{dropout, layer_norm, linear_uniform, linear_xavier, xavier_bound};
use crate::layers::{DropPath, LayerNorm, Mlp};

/// Parameter-name prefix of the patch projection.
pub const PATCH_EMBED_PREFIX: &str = "patch_embed.";

const POS_EMBED_TEMPERATURE: f64 = 10000.0;

// ─── Patch Embedding ─────────────────────────────────────────────────────────

/// Converts images into patch embeddings using a convolutional layer.
pub struct PatchEmbed {
    proj: Conv2d,
    image_size: usize,
    frozen: bool,
}

impl PatchEmbed {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("proj");
        let fan_in = cfg.in_chans * cfg.patch_size * cfg.patch_size;
        let bound = xavier_bound(fan_in, cfg.embed_dim);
        let weight = vb.get_with_hints(
            (cfg.embed_dim, cfg.in_chans, cfg.patch_size, cfg.patch_size),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(cfg.embed_dim, "bias", Init::Const(0.0))?;
        let proj = Conv2d::new(
            weight,
            Some(bias),
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
        );

        Ok(Self {
            proj,
            image_size: cfg.image_size,
            frozen: cfg.freeze_patch_embed,
        })
    }

    /// `[batch, channels, H, W]` -> `[batch, num_patches, embed_dim]`.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = pixel_values.dims4()?;
        if h != self.image_size || w != self.image_size {
            bail!(
                "input spatial size {h}x{w} does not match configured image size {}",
                self.image_size
            );
        }

        // [batch, embed_dim, grid, grid]
        let embeddings = self.proj.forward(pixel_values)?;
        let embeddings = if self.frozen {
            embeddings.detach()
        } else {
            embeddings
        };

        embeddings.flatten(2, 3)?.transpose(1, 2)
    }
}

// ─── Positional Encoding ─────────────────────────────────────────────────────

/// Fixed 2D sin-cos position table of shape `[1, num_special + grid², dim]`.
///
/// Each patch row is `[sin(a·ω), cos(a·ω), sin(b·ω), cos(b·ω)]` with
/// `ω_i = 1 / 10000^(i / (dim/4))`, `a` the grid row and `b` the grid column.
/// Special tokens get an all-zero row.
pub fn sincos_pos_embed(
    grid: usize,
    dim: usize,
    num_special: usize,
    device: &Device,
) -> Result<Tensor> {
    if dim % 4 != 0 {
        bail!("embed_dim {dim} must be divisible by 4 for the 2D sin-cos encoding");
    }
    let pos_dim = dim / 4;
    let omega: Vec<f64> = (0..pos_dim)
        .map(|i| 1.0 / POS_EMBED_TEMPERATURE.powf(i as f64 / pos_dim as f64))
        .collect();

    let num_tokens = num_special + grid * grid;
    let mut table = vec![0f32; num_tokens * dim];
    for k in 0..grid * grid {
        let a = (k / grid) as f64;
        let b = (k % grid) as f64;
        let row = &mut table[(num_special + k) * dim..(num_special + k + 1) * dim];
        for (i, w) in omega.iter().enumerate() {
            row[i] = (a * w).sin() as f32;
            row[pos_dim + i] = (a * w).cos() as f32;
            row[2 * pos_dim + i] = (b * w).sin() as f32;
            row[3 * pos_dim + i] = (b * w).cos() as f32;
        }
    }
    Tensor::from_vec(table, (1, num_tokens, dim), device)
}

// ─── Attention ───────────────────────────────────────────────────────────────

pub struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    attn_drop: f32,
    proj_drop: f32,
}

impl Attention {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        // q, k and v are initialised as three separate dim x dim projections.
        let qkv = linear_uniform(dim, 3 * dim, xavier_bound(dim, dim), cfg.qkv_bias, vb.pp("qkv"))?;
        let proj = linear_xavier(dim, dim, true, vb.pp("proj"))?;
        let head_dim = cfg.head_dim();

        Ok(Self {
            qkv,
            proj,
            num_heads: cfg.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            attn_drop: cfg.attn_drop_rate,
            proj_drop: cfg.drop_rate,
        })
    }

    /// Returns the attended tokens and the attention map `[b, heads, n, n]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (b, n, c) = xs.dims3()?;

        // [3, b, heads, n, head_dim]
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = q.matmul(&k.t()?)?;
        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;
        let attn_dropped = dropout(&attn, self.attn_drop, train)?;

        let out = attn_dropped
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, c))?;
        let out = self.proj.forward(&out)?;
        Ok((dropout(&out, self.proj_drop, train)?, attn))
    }
}

// ─── Transformer Block ───────────────────────────────────────────────────────

pub struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
    drop_path: DropPath,
}

impl Block {
    pub fn new(cfg: &VitConfig, drop_path: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            norm2: layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg.embed_dim, cfg.mlp_hidden_dim(), cfg.drop_rate, vb.pp("mlp"))?,
            drop_path: DropPath::new(drop_path),
        })
    }

    /// Attention map of this block for the given input sequence.
    pub fn attention(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, attn) = self.attn.forward_t(&self.norm1.forward(xs)?, false)?;
        Ok(attn)
    }
}

impl ModuleT for Block {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        // Pre-norm attention
        let (y, _) = self.attn.forward_t(&self.norm1.forward(xs)?, train)?;
        let xs = (xs + self.drop_path.forward_t(&y, train)?)?;

        // Pre-norm MLP
        let y = self.mlp.forward_t(&self.norm2.forward(&xs)?, train)?;
        &xs + self.drop_path.forward_t(&y, train)?
    }
}

// ─── Vision Transformer ──────────────────────────────────────────────────────

pub struct VisionTransformer {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    dist_token: Option<Tensor>,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norms: Vec<LayerNorm>,
    config: VitConfig,
    device: Device,
    dtype: DType,
}

impl VisionTransformer {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        if let Err(e) = cfg.validate() {
            bail!("invalid backbone config: {e}");
        }

        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let token_init = Init::Randn {
            mean: 0.0,
            stdev: 1e-6,
        };
        let cls_token = vb.get_with_hints((1, 1, cfg.embed_dim), "cls_token", token_init)?;
        let dist_token = if cfg.dis_token {
            Some(vb.get_with_hints((1, 1, cfg.embed_dim), "dist_token", token_init)?)
        } else {
            None
        };

        let pos_embed = sincos_pos_embed(
            cfg.num_patches_per_side(),
            cfg.embed_dim,
            cfg.num_special_tokens(),
            vb.device(),
        )?
        .to_dtype(vb.dtype())?;

        let mut blocks = Vec::with_capacity(cfg.depth);
        let mut norms = Vec::with_capacity(cfg.depth);
        let vb_blocks = vb.pp("blocks");
        let vb_norms = vb.pp("norms");
        for (i, rate) in cfg.drop_path_rates().into_iter().enumerate() {
            blocks.push(Block::new(cfg, rate, vb_blocks.pp(i))?);
            norms.push(layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb_norms.pp(i))?);
        }

        Ok(Self {
            patch_embed,
            cls_token,
            dist_token,
            pos_embed,
            blocks,
            norms,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Patch embedding, special tokens and positional encoding: `[b, n, d]`.
    pub fn prepare_tokens(&self, pixel_values: &Tensor, train: bool) -> Result<Tensor> {
        let embeddings = self.patch_embed.forward(pixel_values)?;
        let (batch, _, dim) = embeddings.dims3()?;

        let mut parts = vec![self.cls_token.broadcast_as((batch, 1, dim))?];
        if let Some(dist) = &self.dist_token {
            parts.push(dist.broadcast_as((batch, 1, dim))?);
        }
        parts.push(embeddings);
        let tokens = Tensor::cat(&parts, 1)?.broadcast_add(&self.pos_embed)?;

        dropout(&tokens, self.config.drop_rate, train)
    }

    /// Output sequence of every block, each `[b, n, d]`.
    pub fn forward_blocks(&self, pixel_values: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut xs = self.prepare_tokens(pixel_values, train)?;
        let mut outputs = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
            outputs.push(xs.clone());
        }
        Ok(outputs)
    }

    /// Pooled, normed representation after every block, each `[b, d]`.
    pub fn forward_all_layers(&self, pixel_values: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        self.forward_blocks(pixel_values, train)?
            .iter()
            .zip(&self.norms)
            .map(|(xs, norm)| self.pool(&norm.forward(xs)?))
            .collect()
    }

    /// Pooled representations of the last `n` blocks stacked layer-major
    /// along the batch axis: `[n * b, d]`.
    pub fn get_intermediate_layers(
        &self,
        pixel_values: &Tensor,
        n: usize,
        train: bool,
    ) -> Result<Tensor> {
        if n == 0 || n > self.blocks.len() {
            bail!("requested {n} intermediate layers from a {}-block model", self.blocks.len());
        }
        let layers = self.forward_all_layers(pixel_values, train)?;
        Tensor::cat(&layers[layers.len() - n..], 0)
    }

    /// Attention map of the final block, `[b, heads, n, n]`.
    pub fn get_last_selfattention(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.prepare_tokens(pixel_values, false)?;
        let (last, rest) = match self.blocks.split_last() {
            Some(split) => split,
            None => bail!("model has no blocks"),
        };
        for block in rest {
            xs = block.forward_t(&xs, false)?;
        }
        last.attention(&xs)
    }

    fn pool(&self, xs: &Tensor) -> Result<Tensor> {
        match self.config.pooling {
            Pooling::Mean => xs.mean(1),
            Pooling::Cls => xs.i((.., 0))?.contiguous(),
        }
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    pub fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Parameter-name prefixes excluded from optimisation.
    pub fn frozen_prefixes(&self) -> Vec<&'static str> {
        if self.config.freeze_patch_embed {
            vec![PATCH_EMBED_PREFIX]
        } else {
            Vec::new()
        }
    }
}

impl ModuleT for VisionTransformer {
    /// Pooled output of the final block after its LayerNorm: `[b, d]`.
    fn forward_t(&self, pixel_values: &Tensor, train: bool) -> Result<Tensor> {
        let outputs = self.forward_blocks(pixel_values, train)?;
        match (outputs.last(), self.norms.last()) {
            (Some(xs), Some(norm)) => self.pool(&norm.forward(xs)?),
            _ => bail!("model has no blocks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_cfg() -> VitConfig {
        VitConfig {
            image_size: 32,
            patch_size: 8,
            embed_dim: 32,
            depth: 3,
            num_heads: 4,
            ..VitConfig::default()
        }
    }

    fn build(cfg: &VitConfig) -> (VarMap, VisionTransformer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VisionTransformer::new(cfg, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn sequence_length_is_grid_plus_special_tokens() {
        let cfg = tiny_cfg();
        let (_, model) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let tokens = model.prepare_tokens(&x, false).unwrap();
        assert_eq!(tokens.dims(), &[2, 17, 32]);

        let cfg = VitConfig {
            dis_token: true,
            ..tiny_cfg()
        };
        let (_, model) = build(&cfg);
        let tokens = model.prepare_tokens(&x, false).unwrap();
        assert_eq!(tokens.dims(), &[2, 18, 32]);
    }

    #[test]
    fn every_block_preserves_shape() {
        let cfg = tiny_cfg();
        let (_, model) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let outputs = model.forward_blocks(&x, true).unwrap();
        assert_eq!(outputs.len(), 3);
        for out in outputs {
            assert_eq!(out.dims(), &[2, 17, 32]);
        }
        let pooled = model.forward_t(&x, false).unwrap();
        assert_eq!(pooled.dims(), &[2, 32]);
    }

    #[test]
    fn intermediate_layers_are_layer_major() {
        let cfg = tiny_cfg();
        let (_, model) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();

        let stacked = model.get_intermediate_layers(&x, 3, false).unwrap();
        assert_eq!(stacked.dims(), &[6, 32]);

        // The last slice equals the regular forward output.
        let last: Vec<Vec<f32>> = stacked.narrow(0, 4, 2).unwrap().to_vec2().unwrap();
        let out: Vec<Vec<f32>> = model.forward_t(&x, false).unwrap().to_vec2().unwrap();
        for (a, b) in last.iter().flatten().zip(out.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }

        assert!(model.get_intermediate_layers(&x, 4, false).is_err());
    }

    #[test]
    fn last_selfattention_rows_sum_to_one() {
        let cfg = tiny_cfg();
        let (_, model) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let attn = model.get_last_selfattention(&x).unwrap();
        assert_eq!(attn.dims(), &[1, 4, 17, 17]);

        let sums: Vec<f32> = attn.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn wrong_spatial_size_is_rejected() {
        let cfg = tiny_cfg();
        let (_, model) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (1, 3, 40, 40), &Device::Cpu).unwrap();
        assert!(model.forward_t(&x, false).is_err());
    }

    #[test]
    fn invalid_embed_dim_fails_construction() {
        let cfg = VitConfig {
            embed_dim: 30,
            num_heads: 3,
            ..tiny_cfg()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(VisionTransformer::new(&cfg, vb).is_err());
    }

    #[test]
    fn pos_embed_layout() {
        let table = sincos_pos_embed(2, 8, 1, &Device::Cpu).unwrap();
        assert_eq!(table.dims(), &[1, 5, 8]);
        let rows: Vec<Vec<f32>> = table.squeeze(0).unwrap().to_vec2().unwrap();

        // Special token row is zero.
        assert!(rows[0].iter().all(|v| *v == 0.0));
        // Patch (0, 0): sin terms 0, cos terms 1.
        assert_eq!(rows[1], vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        // Patch (1, 0): grid row 1, ω_0 = 1.
        assert!((rows[3][0] - 1f32.sin()).abs() < 1e-6);
        assert!((rows[3][2] - 1f32.cos()).abs() < 1e-6);
        assert_eq!(rows[3][4], 0.0);

        assert!(sincos_pos_embed(2, 6, 1, &Device::Cpu).is_err());
    }

    #[test]
    fn patch_embed_receives_no_gradient_when_frozen() {
        let cfg = tiny_cfg();
        let (varmap, model) = build(&cfg);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let loss = model.forward_t(&x, true).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let data = varmap.data().lock().unwrap();
        let patch = data.get("patch_embed.proj.weight").unwrap();
        assert!(grads.get(patch.as_tensor()).is_none());
        let qkv = data.get("blocks.0.attn.qkv.weight").unwrap();
        assert!(grads.get(qkv.as_tensor()).is_some());
        assert_eq!(model.frozen_prefixes(), vec![PATCH_EMBED_PREFIX]);
    }
}
