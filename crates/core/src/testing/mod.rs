//! Shared test utilities for mvit-core.
//!
//! Tiny configurations and synthetic batches for unit and integration tests.

mod batches;
mod tiny_config;

pub use batches::{random_two_view_batch, synthetic_splits};
pub use tiny_config::{tiny_head_config, tiny_trainer_config, tiny_vit_config};
