use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a backbone configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown architecture: {0}")]
    UnknownArch(String),

    #[error("embed_dim {embed_dim} must be divisible by 4 for the 2D sin-cos encoding")]
    EmbedDimNotDivisibleBy4 { embed_dim: usize },

    #[error("embed_dim {embed_dim} is not divisible by num_heads {num_heads}")]
    HeadsDoNotDivide { embed_dim: usize, num_heads: usize },

    #[error("image_size {image_size} is not divisible by patch_size {patch_size}")]
    ImageNotDivisible { image_size: usize, patch_size: usize },

    #[error("{field} must be > 0")]
    Zero { field: &'static str },
}

/// How the final token sequence is pooled into a single representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// Mean over all tokens, special tokens included.
    #[default]
    Mean,
    /// The CLS token only.
    Cls,
}

/// Vision Transformer backbone configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub drop_rate: f32,
    #[serde(default)]
    pub attn_drop_rate: f32,
    #[serde(default)]
    pub drop_path_rate: f32,
    /// Adds a distillation token after the CLS token (DeiT).
    #[serde(default)]
    pub dis_token: bool,
    #[serde(default)]
    pub pooling: Pooling,
    /// Keep the patch projection at its random initialisation.
    #[serde(default = "default_true")]
    pub freeze_patch_embed: bool,
}

fn default_true() -> bool {
    true
}

impl Default for VitConfig {
    fn default() -> Self {
        // ViT-S/16 @ 224px
        Self {
            image_size: 224,
            patch_size: 16,
            in_chans: 3,
            embed_dim: 384,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4.0,
            qkv_bias: true,
            layer_norm_eps: 1e-6,
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.0,
            dis_token: false,
            pooling: Pooling::Mean,
            freeze_patch_embed: true,
        }
    }
}

impl VitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("patch_size", self.patch_size),
            ("image_size", self.image_size),
            ("embed_dim", self.embed_dim),
            ("depth", self.depth),
            ("num_heads", self.num_heads),
            ("in_chans", self.in_chans),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.embed_dim % 4 != 0 {
            return Err(ConfigError::EmbedDimNotDivisibleBy4 {
                embed_dim: self.embed_dim,
            });
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(ConfigError::HeadsDoNotDivide {
                embed_dim: self.embed_dim,
                num_heads: self.num_heads,
            });
        }
        if self.image_size % self.patch_size != 0 {
            return Err(ConfigError::ImageNotDivisible {
                image_size: self.image_size,
                patch_size: self.patch_size,
            });
        }
        Ok(())
    }

    /// Number of patches per image dimension.
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Total number of patches, special tokens excluded.
    pub fn num_patches(&self) -> usize {
        let n = self.num_patches_per_side();
        n * n
    }

    /// CLS, plus the distillation token when enabled.
    pub fn num_special_tokens(&self) -> usize {
        if self.dis_token {
            2
        } else {
            1
        }
    }

    pub fn seq_len(&self) -> usize {
        self.num_patches() + self.num_special_tokens()
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Stochastic depth rate of each block, linear from 0 to `drop_path_rate`.
    pub fn drop_path_rates(&self) -> Vec<f32> {
        if self.depth == 1 {
            return vec![0.0];
        }
        (0..self.depth)
            .map(|i| self.drop_path_rate * i as f32 / (self.depth - 1) as f32)
            .collect()
    }
}

/// Named backbone presets.
///
/// Closed set: adding a variant forces every `match` over it to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    VitTiny,
    VitSmall,
    VitBase,
    DeitSmall,
    DeitBase,
}

impl Arch {
    pub const ALL: [Arch; 5] = [
        Arch::VitTiny,
        Arch::VitSmall,
        Arch::VitBase,
        Arch::DeitSmall,
        Arch::DeitBase,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Arch::VitTiny => "vit_tiny",
            Arch::VitSmall => "vit_small",
            Arch::VitBase => "vit_base",
            Arch::DeitSmall => "deit_small",
            Arch::DeitBase => "deit_base",
        }
    }

    /// Build the preset configuration at the given patch and image size.
    pub fn config(self, patch_size: usize, image_size: usize) -> VitConfig {
        let (embed_dim, depth, num_heads, dis_token) = match self {
            Arch::VitTiny => (192, 12, 3, false),
            Arch::VitSmall => (384, 12, 12, false),
            Arch::VitBase => (768, 12, 12, false),
            Arch::DeitSmall => (384, 12, 6, true),
            Arch::DeitBase => (768, 12, 12, true),
        };
        VitConfig {
            image_size,
            patch_size,
            embed_dim,
            depth,
            num_heads,
            dis_token,
            ..VitConfig::default()
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arch::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| ConfigError::UnknownArch(s.to_string()))
    }
}
