//! RGB float images backed by [`image::Rgb32FImage`].

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Rgb, Rgb32FImage, RgbImage};

use super::{DataError, Result};

/// An RGB image with values in `[0, 1]` until it is normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    image: Rgb32FImage,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn from_image(image: Rgb32FImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DataError::Format(format!(
                "empty frame {}x{}",
                image.height(),
                image.width()
            )));
        }
        Ok(Self { image })
    }

    /// Build pixel by pixel; `f` receives `(y, x)`.
    pub fn from_fn(
        height: usize,
        width: usize,
        mut f: impl FnMut(usize, usize) -> [f32; 3],
    ) -> Result<Self> {
        Self::from_image(ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Rgb(f(y as usize, x as usize))
        }))
    }

    pub fn filled(height: usize, width: usize, value: f32) -> Self {
        Self {
            image: ImageBuffer::from_pixel(width as u32, height as u32, Rgb([value; 3])),
        }
    }

    /// From interleaved 8-bit RGB rows.
    pub fn from_rgb8(width: usize, height: usize, pixels: &[u8]) -> Result<Self> {
        let rgb = RgbImage::from_raw(width as u32, height as u32, pixels.to_vec()).ok_or_else(
            || {
                DataError::Format(format!(
                    "{width}x{height} RGB needs {} bytes, got {}",
                    width * height * 3,
                    pixels.len()
                ))
            },
        )?;
        Self::from_dynamic(&DynamicImage::ImageRgb8(rgb))
    }

    pub fn from_dynamic(img: &DynamicImage) -> Result<Self> {
        Self::from_image(img.to_rgb32f())
    }

    pub fn channels(&self) -> usize {
        Self::CHANNELS
    }

    pub fn height(&self) -> usize {
        self.image.height() as usize
    }

    pub fn width(&self) -> usize {
        self.image.width() as usize
    }

    pub fn image(&self) -> &Rgb32FImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Rgb32FImage {
        &mut self.image
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.image.get_pixel(x as u32, y as u32)[c]
    }

    /// Sub-rectangle; the caller keeps it inside the frame.
    pub fn crop(&self, top: usize, left: usize, height: usize, width: usize) -> Frame {
        let view = imageops::crop_imm(
            &self.image,
            left as u32,
            top as u32,
            width as u32,
            height as u32,
        );
        Frame {
            image: view.to_image(),
        }
    }

    pub fn resize(&self, height: usize, width: usize, filter: FilterType) -> Frame {
        if height == self.height() && width == self.width() {
            return self.clone();
        }
        Frame {
            image: imageops::resize(&self.image, width as u32, height as u32, filter),
        }
    }

    /// Stack equally sized frames into a `[b, 3, h, w]` tensor.
    pub fn stack(frames: &[Frame], device: &Device) -> Result<Tensor> {
        let first = frames.first().ok_or(DataError::Empty)?;
        let (h, w) = (first.height(), first.width());
        let mut data = Vec::with_capacity(frames.len() * Self::CHANNELS * h * w);
        for f in frames {
            if (f.height(), f.width()) != (h, w) {
                return Err(DataError::Format(format!(
                    "cannot stack {}x{} with {h}x{w}",
                    f.height(),
                    f.width()
                )));
            }
            data.extend_from_slice(f.image.as_raw());
        }
        let hwc = Tensor::from_vec(data, (frames.len(), h, w, Self::CHANNELS), device)?;
        Ok(hwc.permute((0, 3, 1, 2))?.contiguous()?)
    }
}

impl From<Rgb32FImage> for Frame {
    fn from(image: Rgb32FImage) -> Self {
        Self { image }
    }
}
