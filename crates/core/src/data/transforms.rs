//! Image augmentations on [`Frame`]s.
//!
//! Every random transform draws from the caller's RNG, so a pipeline applied
//! with a seeded RNG is reproducible.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel, Rgb};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::frame::Frame;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub trait Transform: Send + Sync {
    fn apply(&self, frame: Frame, rng: &mut StdRng) -> Frame;
}

/// Transforms applied in order.
#[derive(Default)]
pub struct Compose {
    steps: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: impl Transform + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Transform for Compose {
    fn apply(&self, frame: Frame, rng: &mut StdRng) -> Frame {
        self.steps.iter().fold(frame, |f, step| step.apply(f, rng))
    }
}

/// Apply the inner transform with probability `p`.
pub struct RandomApply<T> {
    pub inner: T,
    pub p: f64,
}

impl<T: Transform> Transform for RandomApply<T> {
    fn apply(&self, frame: Frame, rng: &mut StdRng) -> Frame {
        if self.p >= 1.0 || (self.p > 0.0 && rng.gen_bool(self.p)) {
            self.inner.apply(frame, rng)
        } else {
            frame
        }
    }
}

/// Crop a random area and aspect ratio, then resize to `size x size`.
pub struct RandomResizedCrop {
    pub size: usize,
    pub scale: (f64, f64),
    pub ratio: (f64, f64),
}

impl RandomResizedCrop {
    pub fn new(size: usize, scale: (f64, f64)) -> Self {
        Self {
            size,
            scale,
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        }
    }

    fn window(&self, height: usize, width: usize, rng: &mut StdRng) -> (usize, usize, usize, usize) {
        let area = (height * width) as f64;
        let (log_lo, log_hi) = (self.ratio.0.ln(), self.ratio.1.ln());
        for _ in 0..10 {
            let target = area * rng.gen_range(self.scale.0..=self.scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();
            let w = (target * aspect).sqrt().round() as usize;
            let h = (target / aspect).sqrt().round() as usize;
            if w > 0 && w <= width && h > 0 && h <= height {
                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                return (top, left, h, w);
            }
        }
        // Fallback: central crop with the aspect ratio clamped into range.
        let in_ratio = width as f64 / height as f64;
        let (h, w) = if in_ratio < self.ratio.0 {
            ((width as f64 / self.ratio.0).round() as usize, width)
        } else if in_ratio > self.ratio.1 {
            (height, (height as f64 * self.ratio.1).round() as usize)
        } else {
            (height, width)
        };
        let (h, w) = (h.clamp(1, height), w.clamp(1, width));
        ((height - h) / 2, (width - w) / 2, h, w)
    }
}

impl Transform for RandomResizedCrop {
    fn apply(&self, frame: Frame, rng: &mut StdRng) -> Frame {
        let (top, left, h, w) = self.window(frame.height(), frame.width(), rng);
        frame
            .crop(top, left, h, w)
            .resize(self.size, self.size, FilterType::Triangle)
    }
}

/// Resize to `height x width`.
pub struct Resize {
    pub height: usize,
    pub width: usize,
    pub filter: FilterType,
}

impl Resize {
    /// Square bicubic resize.
    pub fn bicubic(side: usize) -> Self {
        Self {
            height: side,
            width: side,
            filter: FilterType::CatmullRom,
        }
    }
}

impl Transform for Resize {
    fn apply(&self, frame: Frame, _rng: &mut StdRng) -> Frame {
        frame.resize(self.height, self.width, self.filter)
    }
}

/// Central `size x size` window; frames smaller than `size` are resized up
/// first.
pub struct CenterCrop {
    pub size: usize,
}

impl Transform for CenterCrop {
    fn apply(&self, frame: Frame, _rng: &mut StdRng) -> Frame {
        let frame = if frame.height() < self.size || frame.width() < self.size {
            let h = frame.height().max(self.size);
            let w = frame.width().max(self.size);
            frame.resize(h, w, FilterType::CatmullRom)
        } else {
            frame
        };
        let top = (frame.height() - self.size) / 2;
        let left = (frame.width() - self.size) / 2;
        frame.crop(top, left, self.size, self.size)
    }
}

pub struct HorizontalFlip {
    pub p: f64,
}

impl Transform for HorizontalFlip {
    fn apply(&self, frame: Frame, rng: &mut StdRng) -> Frame {
        if !rng.gen_bool(self.p) {
            return frame;
        }
        Frame::from(imageops::flip_horizontal(frame.image()))
    }
}

fn luma(px: &Rgb<f32>) -> f32 {
    px.to_luma()[0]
}

fn blend(value: f32, other: f32, factor: f32) -> f32 {
    (other + factor * (value - other)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy)]
enum JitterOp {
    Brightness(f32),
    Contrast(f32),
    Saturation(f32),
    /// Rotation in degrees.
    Hue(i32),
}

/// Random brightness, contrast, saturation and hue, applied in random order.
#[derive(Debug, Clone, Copy)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    /// Fraction of a full turn, as a maximum shift.
    pub hue: f32,
}

impl ColorJitter {
    fn factor(strength: f32, rng: &mut StdRng) -> Option<f32> {
        (strength > 0.0).then(|| rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength))
    }

    fn ops(&self, rng: &mut StdRng) -> Vec<JitterOp> {
        let mut ops = Vec::with_capacity(4);
        if let Some(f) = Self::factor(self.brightness, rng) {
            ops.push(JitterOp::Brightness(f));
        }
        if let Some(f) = Self::factor(self.contrast, rng) {
            ops.push(JitterOp::Contrast(f));
        }
        if let Some(f) = Self::factor(self.saturation, rng) {
            ops.push(JitterOp::Saturation(f));
        }
        if self.hue > 0.0 {
            let shift = rng.gen_range(-self.hue..=self.hue);
            ops.push(JitterOp::Hue((shift * 360.0).round() as i32));
        }
        ops.shuffle(rng);
        ops
    }
}

impl Transform for ColorJitter {
    fn apply(&self, mut frame: Frame, rng: &mut StdRng) -> Frame {
        for op in self.ops(rng) {
            match op {
                JitterOp::Brightness(f) => {
                    frame
                        .image_mut()
                        .iter_mut()
                        .for_each(|v| *v = (*v * f).clamp(0.0, 1.0));
                }
                JitterOp::Contrast(f) => {
                    let image = frame.image_mut();
                    let mean = image.pixels().map(luma).sum::<f32>()
                        / (image.width() * image.height()) as f32;
                    image.iter_mut().for_each(|v| *v = blend(*v, mean, f));
                }
                JitterOp::Saturation(f) => {
                    for px in frame.image_mut().pixels_mut() {
                        let gray = luma(px);
                        px.apply(|v| blend(v, gray, f));
                    }
                }
                JitterOp::Hue(0) => {}
                JitterOp::Hue(degrees) => {
                    let mut rotated = imageops::huerotate(frame.image(), degrees);
                    rotated.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
                    frame = Frame::from(rotated);
                }
            }
        }
        frame
    }
}

/// Replace RGB by its luma, replicated over the three channels.
pub struct Grayscale;

impl Transform for Grayscale {
    fn apply(&self, frame: Frame, _rng: &mut StdRng) -> Frame {
        let gray = imageops::grayscale(frame.image());
        Frame::from(ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
            let l = gray.get_pixel(x, y)[0];
            Rgb([l, l, l])
        }))
    }
}

/// Gaussian blur with `sigma` drawn from a range.
pub struct GaussianBlur {
    pub sigma: (f32, f32),
}

impl GaussianBlur {
    pub fn new(sigma_min: f32, sigma_max: f32) -> Self {
        Self {
            sigma: (sigma_min, sigma_max),
        }
    }
}

impl Transform for GaussianBlur {
    fn apply(&self, frame: Frame, rng: &mut StdRng) -> Frame {
        let sigma = rng.gen_range(self.sigma.0..=self.sigma.1);
        Frame::from(imageops::blur(frame.image(), sigma))
    }
}

/// Invert every value at or above `threshold`.
pub struct Solarize {
    pub threshold: f32,
}

impl Default for Solarize {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl Transform for Solarize {
    fn apply(&self, mut frame: Frame, _rng: &mut StdRng) -> Frame {
        for v in frame.image_mut().iter_mut() {
            if *v >= self.threshold {
                *v = 1.0 - *v;
            }
        }
        frame
    }
}

/// Per-channel `(x - mean) / std`.
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl Transform for Normalize {
    fn apply(&self, mut frame: Frame, _rng: &mut StdRng) -> Frame {
        for px in frame.image_mut().pixels_mut() {
            for c in 0..Frame::CHANNELS {
                px[c] = (px[c] - self.mean[c]) / self.std[c];
            }
        }
        frame
    }
}

/// The two asymmetric views of the momentum objective.
pub struct TwoViews {
    pub first: Compose,
    pub second: Compose,
}

impl TwoViews {
    /// Shared crop/jitter/grayscale; blur always on the first view and rarely
    /// on the second; solarize only on the second.
    pub fn momentum(image_size: usize) -> Self {
        let view = |blur_p: f64, solarize_p: f64| {
            Compose::new()
                .then(RandomResizedCrop::new(image_size, (0.08, 1.0)))
                .then(RandomApply {
                    inner: ColorJitter {
                        brightness: 0.4,
                        contrast: 0.4,
                        saturation: 0.2,
                        hue: 0.1,
                    },
                    p: 0.8,
                })
                .then(RandomApply {
                    inner: Grayscale,
                    p: 0.2,
                })
                .then(RandomApply {
                    inner: GaussianBlur::new(0.1, 2.0),
                    p: blur_p,
                })
                .then(RandomApply {
                    inner: Solarize::default(),
                    p: solarize_p,
                })
                .then(HorizontalFlip { p: 0.5 })
                .then(Normalize::imagenet())
        };
        Self {
            first: view(1.0, 0.0),
            second: view(0.1, 0.2),
        }
    }

    /// Both views share the strong-jitter SimCLR pipeline.
    pub fn simclr(image_size: usize) -> Self {
        let view = || {
            Compose::new()
                .then(RandomApply {
                    inner: ColorJitter {
                        brightness: 0.8,
                        contrast: 0.8,
                        saturation: 0.8,
                        hue: 0.2,
                    },
                    p: 0.3,
                })
                .then(RandomApply {
                    inner: Grayscale,
                    p: 0.2,
                })
                .then(HorizontalFlip { p: 0.5 })
                .then(RandomApply {
                    inner: GaussianBlur::new(1.0, 2.0),
                    p: 0.2,
                })
                .then(RandomResizedCrop::new(image_size, (0.08, 1.0)))
                .then(Normalize::imagenet())
        };
        Self {
            first: view(),
            second: view(),
        }
    }
}

/// Deterministic evaluation pipeline: square bicubic resize, center crop,
/// normalise.
pub fn eval_transform(resize: usize, crop: usize) -> Compose {
    Compose::new()
        .then(Resize::bicubic(resize))
        .then(CenterCrop { size: crop })
        .then(Normalize::imagenet())
}
