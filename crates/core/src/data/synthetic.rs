//! Procedural labelled images for smoke runs and tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::frame::Frame;
use super::{DataError, ImageDataset, Result};

/// Each class has a fixed base colour and stripe frequency; samples add
/// per-index noise. Sample `i` has class `i % num_classes`.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    len: usize,
    num_classes: usize,
    image_size: usize,
    seed: u64,
    noise_offset: u64,
}

impl SyntheticDataset {
    pub fn new(len: usize, num_classes: usize, image_size: usize, seed: u64) -> Self {
        Self {
            len,
            num_classes: num_classes.max(1),
            image_size,
            seed,
            noise_offset: 0,
        }
    }

    /// Same class palettes, different per-sample noise.
    pub fn with_noise_offset(mut self, offset: u64) -> Self {
        self.noise_offset = offset;
        self
    }

    fn class_palette(&self, class: usize) -> ([f32; 3], f32) {
        let mut rng = StdRng::seed_from_u64(self.seed ^ (class as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let color = [rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()];
        let freq = 1.0 + class as f32;
        (color, freq)
    }
}

impl ImageDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Frame> {
        if index >= self.len {
            return Err(DataError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        let class = index % self.num_classes;
        let (color, freq) = self.class_palette(class);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.noise_offset + index as u64 + 1));
        let side = self.image_size;
        Frame::from_fn(side, side, |y, x| {
            let stripe = 0.25 * (freq * (x + y) as f32 / side as f32 * std::f32::consts::PI).sin();
            color.map(|base| (base + stripe + rng.gen_range(-0.05f32..0.05)).clamp(0.0, 1.0))
        })
    }

    fn label(&self, index: usize) -> Option<u32> {
        (index < self.len).then(|| (index % self.num_classes) as u32)
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.num_classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_deterministic() {
        let ds = SyntheticDataset::new(10, 3, 8, 1);
        assert_eq!(ds.get(4).unwrap(), ds.get(4).unwrap());
        assert_ne!(ds.get(4).unwrap(), ds.get(5).unwrap());
        assert_eq!(ds.label(4), Some(1));
        assert_eq!(ds.label(10), None);
        assert!(ds.get(10).is_err());

        let shifted = ds.clone().with_noise_offset(100);
        assert_ne!(ds.get(4).unwrap(), shifted.get(4).unwrap());
        assert_eq!(shifted.label(4), Some(1));
    }
}
