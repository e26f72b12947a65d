use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};

use crate::config::VisionConfig;
use crate::error::JoyCaptionError;

/// Open an image file and convert it to RGB8.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage, JoyCaptionError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(JoyCaptionError::ImageNotFound(path.to_path_buf()));
    }
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    Ok(DynamicImage::ImageRgb8(img.into_rgb8()))
}

pub struct ImageProcessorConfig {
    pub image_size: u32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
}

impl ImageProcessorConfig {
    pub fn from_vision_config(cfg: &VisionConfig) -> Self {
        Self {
            image_size: cfg.image_size as u32,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            rescale_factor: 1.0 / 255.0,
        }
    }
}

/// Turns images into the normalized pixel tensor expected by the vision tower.
pub struct ImageProcessor {
    config: ImageProcessorConfig,
    mean: Tensor,
    std: Tensor,
    dtype: DType,
    device: Device,
}

impl ImageProcessor {
    pub fn new(
        config: ImageProcessorConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, JoyCaptionError> {
        Ok(Self {
            mean: Tensor::from_slice(&config.image_mean, (3, 1, 1), device)?,
            std: Tensor::from_slice(&config.image_std, (3, 1, 1), device)?,
            config,
            dtype,
            device: device.clone(),
        })
    }

    /// Resize to the square input size and normalize, returning `[1, 3, size, size]`.
    pub fn preprocess(&self, img: &DynamicImage) -> Result<Tensor, JoyCaptionError> {
        let size = self.config.image_size;
        log::debug!(
            "Image size: {}x{} resized to {size}x{size}",
            img.width(),
            img.height()
        );

        let rgb = img
            .resize_exact(size, size, FilterType::CatmullRom)
            .into_rgb8();
        let pixels = Tensor::from_vec(rgb.into_raw(), (size as usize, size as usize, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;

        let pixels = (pixels * self.config.rescale_factor as f64)?
            .broadcast_sub(&self.mean)?
            .broadcast_div(&self.std)?;

        Ok(pixels.unsqueeze(0)?.to_dtype(self.dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    use crate::test_utils::tiny_vision_config;

    fn processor() -> Result<ImageProcessor, JoyCaptionError> {
        ImageProcessor::new(
            ImageProcessorConfig::from_vision_config(&tiny_vision_config()),
            DType::F32,
            &Device::Cpu,
        )
    }

    #[test]
    fn normalizes_to_unit_range() -> Result<(), JoyCaptionError> {
        let processor = processor()?;

        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([255, 255, 255])));
        let pixels = processor.preprocess(&white)?;
        assert_eq!(pixels.dims(), &[1, 3, 28, 28]);
        let min = pixels.min_all()?.to_scalar::<f32>()?;
        approx::assert_relative_eq!(min, 1.0, epsilon = 1e-6);

        let black = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let max = processor.preprocess(&black)?.max_all()?.to_scalar::<f32>()?;
        approx::assert_relative_eq!(max, -1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn channels_first() -> Result<(), JoyCaptionError> {
        let processor = processor()?;
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(28, 28, Rgb([255, 0, 0])));
        let pixels = processor.preprocess(&red)?.squeeze(0)?;

        let means = pixels.mean_keepdim(2)?.mean_keepdim(1)?.flatten_all()?;
        let means = means.to_vec1::<f32>()?;
        approx::assert_relative_eq!(means[0], 1.0, epsilon = 1e-5);
        approx::assert_relative_eq!(means[1], -1.0, epsilon = 1e-5);
        approx::assert_relative_eq!(means[2], -1.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn load_image_errors() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;

        let missing = dir.path().join("missing.png");
        assert!(matches!(
            load_image(&missing),
            Err(JoyCaptionError::ImageNotFound(path)) if path == missing
        ));

        let garbage = dir.path().join("garbage.png");
        std::fs::write(&garbage, b"not an image")?;
        assert!(load_image(&garbage).is_err());
        Ok(())
    }

    #[test]
    fn load_image_converts_to_rgb() -> Result<(), JoyCaptionError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gray.png");
        image::GrayImage::from_pixel(8, 6, image::Luma([128])).save(&path)?;

        let img = load_image(&path)?;
        assert!(matches!(img, DynamicImage::ImageRgb8(_)));
        assert_eq!((img.width(), img.height()), (8, 6));
        Ok(())
    }
}
