pub mod drop_path;
pub mod mlp;
pub mod normalization;

pub use drop_path::DropPath;
pub(crate) use mlp::dropout;
pub use mlp::{linear_normal, linear_uniform, linear_xavier, xavier_bound, Mlp};
pub use normalization::{batch_norm_1d, layer_norm, BatchNorm1d, LayerNorm};
