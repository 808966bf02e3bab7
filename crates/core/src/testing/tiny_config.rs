use crate::config::{Arch, VitConfig};
use crate::head::HeadConfig;
use crate::trainer::{Method, TrainerConfig};

/// Image side of every tiny config.
pub const TINY_IMAGE: usize = 16;

/// A 3-block ViT on 16x16 images with 8x8 patches (4 patches + CLS).
pub fn tiny_vit_config() -> VitConfig {
    VitConfig {
        image_size: TINY_IMAGE,
        patch_size: 8,
        embed_dim: 16,
        depth: 3,
        num_heads: 2,
        ..VitConfig::default()
    }
}

pub fn tiny_head_config() -> HeadConfig {
    HeadConfig {
        out_dim: 8,
        hidden_dim: 32,
    }
}

/// Smallest registered architecture at 16x16, two epochs, no warmup.
pub fn tiny_trainer_config(method: Method, batch_size: usize) -> TrainerConfig {
    TrainerConfig {
        method,
        arch: Arch::VitTiny,
        patch_size: 8,
        image_size: TINY_IMAGE,
        out_dim: 8,
        mlp_hidden: 32,
        lr: 0.05,
        min_lr: 1e-4,
        clip_grad: 3.0,
        batch_size_per_worker: batch_size,
        epochs: 2,
        max_epochs: 2,
        warmup_epochs: 0,
        val_interval: 1,
        knn_k: 5,
        ..TrainerConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_configs_are_valid() {
        tiny_vit_config().validate().unwrap();
        assert_eq!(tiny_vit_config().seq_len(), 5);
        tiny_trainer_config(Method::Simclr, 4).validate().unwrap();
    }
}
