use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::path::Path;

use crate::error::{Result, TriageError};

/// Cropping and resizing applied to every X-ray before it reaches the model.
#[derive(Debug, Clone, Copy)]
pub struct Preprocess {
    pub input_size: usize,
    pub top_percent: f32,
}

impl Preprocess {
    pub fn new(input_size: usize, top_percent: f32) -> Self {
        Self {
            input_size,
            top_percent,
        }
    }

    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).map_err(|source| TriageError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.apply(&img))
    }

    /// Drop the top band of the image, center-crop to a square, resize and
    /// return CHW floats scaled to `[0, 1]`.
    pub fn apply(&self, img: &DynamicImage) -> Vec<f32> {
        let (width, height) = img.dimensions();
        let top = (height as f32 * self.top_percent).floor() as u32;
        let cropped = img.crop_imm(0, top, width, height - top);

        let (width, height) = cropped.dimensions();
        let side = width.min(height);
        let square = cropped.crop_imm((width - side) / 2, (height - side) / 2, side, side);

        let size = self.input_size as u32;
        let rgb = square
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let plane = self.input_size * self.input_size;
        let mut chw = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * self.input_size + x as usize;
            for channel in 0..3 {
                chw[channel * plane + offset] = pixel[channel] as f32 / 255.0;
            }
        }
        chw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_output_shape_and_range() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([255, 0, 128])));
        let chw = Preprocess::new(16, 0.08).apply(&img);
        assert_eq!(chw.len(), 3 * 16 * 16);
        assert!((chw[0] - 1.0).abs() < 1e-6);
        assert!(chw[16 * 16].abs() < 1e-6);
        assert!(chw.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_top_band_is_removed() {
        // Bright top rows, dark below: cropping 50% from the top leaves only dark pixels.
        let mut img = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        for y in 0..10 {
            for x in 0..20 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let chw = Preprocess::new(8, 0.5).apply(&DynamicImage::ImageRgb8(img));
        assert!(chw.iter().all(|v| *v < 1e-6));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Preprocess::new(8, 0.0)
            .load(Path::new("/definitely/not/here.png"))
            .unwrap_err();
        assert!(matches!(err, TriageError::Image { .. }));
    }
}
