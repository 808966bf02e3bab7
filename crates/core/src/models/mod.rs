//! Backbone registry.
//!
//! Architectures form a closed set ([`Arch`]); [`from_arch`] is the single
//! place that maps a preset onto a constructed backbone.

pub mod vit;

use candle_nn::VarBuilder;

use crate::config::{Arch, ConfigError, VitConfig};

pub use vit::{sincos_pos_embed, Attention, Block, PatchEmbed, VisionTransformer, PATCH_EMBED_PREFIX};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid model config: {0}")]
    Config(#[from] ConfigError),
    #[error("model load error: {0}")]
    Load(#[from] candle_core::Error),
}

/// Construct a backbone from an explicit configuration.
pub fn from_config(cfg: &VitConfig, vb: VarBuilder) -> Result<VisionTransformer, ModelError> {
    cfg.validate()?;
    Ok(VisionTransformer::new(cfg, vb)?)
}

/// Construct a preset backbone at the given patch and image size.
pub fn from_arch(
    arch: Arch,
    patch_size: usize,
    image_size: usize,
    vb: VarBuilder,
) -> Result<VisionTransformer, ModelError> {
    from_config(&arch.config(patch_size, image_size), vb)
}

/// Construct a backbone from an architecture name such as `"vit_small"`.
pub fn from_name(
    name: &str,
    patch_size: usize,
    image_size: usize,
    vb: VarBuilder,
) -> Result<VisionTransformer, ModelError> {
    let arch: Arch = name.parse()?;
    from_arch(arch, patch_size, image_size, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn unknown_arch_is_a_config_error() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = from_name("vit_giant", 16, 224, vb).err().unwrap();
        assert!(matches!(err, ModelError::Config(ConfigError::UnknownArch(_))));
    }

    #[test]
    fn preset_builds_with_expected_dims() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = from_arch(Arch::VitTiny, 16, 32, vb).unwrap();
        assert_eq!(model.embed_dim(), 192);
        assert_eq!(model.depth(), 12);
        assert_eq!(model.config().seq_len(), 5);
    }

    #[test]
    fn indivisible_image_size_fails_before_allocation() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = from_arch(Arch::VitSmall, 16, 100, vb).err().unwrap();
        assert!(matches!(err, ModelError::Config(ConfigError::ImageNotDivisible { .. })));
    }
}
