//! Event logging for a training run: scalars as JSON lines, semantic heatmaps
//! as PNG overlays.

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor};
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::training::eval::Metrics;

#[derive(Debug, Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
    wall_time: f64,
}

pub struct SummaryWriter {
    images_dir: PathBuf,
    scalars: File,
}

impl SummaryWriter {
    /// Create `<run_dir>/events/` and open its scalar log for appending.
    pub fn new(run_dir: &Path) -> Result<Self> {
        let events_dir = run_dir.join("events");
        let images_dir = events_dir.join("images");
        fs::create_dir_all(&images_dir)
            .with_context(|| format!("Failed to create events directory: {:?}", events_dir))?;

        let path = events_dir.join("scalars.jsonl");
        let scalars = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open scalar log: {:?}", path))?;

        Ok(Self { images_dir, scalars })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag,
            value,
            step,
            wall_time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        let line = serde_json::to_string(&event).with_context(|| "Failed to serialize scalar")?;
        writeln!(self.scalars, "{}", line).with_context(|| "Failed to write scalar")?;
        Ok(())
    }

    /// One scalar per metric, tagged `<prefix><name>`.
    pub fn add_scalars(&mut self, prefix: &str, metrics: &Metrics, step: usize) -> Result<()> {
        for (name, value) in metrics {
            self.add_scalar(&format!("{prefix}{name}"), *value, step)?;
        }
        Ok(())
    }

    /// Overlay each mask `[N, 1, H, W]` in red on its image `[N, C, H, W]`.
    /// At most `max_outputs` images are written.
    pub fn add_heatmaps<B: Backend>(
        &mut self,
        tag: &str,
        images: Tensor<B, 4>,
        masks: Tensor<B, 4>,
        step: usize,
        max_outputs: usize,
    ) -> Result<Vec<PathBuf>> {
        let [batch, channels, height, width] = images.dims();
        let count = batch.min(max_outputs);
        if count == 0 {
            return Ok(Vec::new());
        }

        let gray = images
            .narrow(0, 0, count)
            .mean_dim(1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to read images: {:?}", e))?;
        let masks = masks
            .narrow(0, 0, count)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to read masks: {:?}", e))?;

        let plane = height * width;
        let name = tag.replace('/', "_");
        let mut written = Vec::with_capacity(count);
        for i in 0..count {
            let overlay = heatmap_overlay(
                &gray[i * plane..(i + 1) * plane],
                &masks[i * plane..(i + 1) * plane],
                width,
                height,
            );
            let path = self.images_dir.join(format!("{name}_{step}_{i}.png"));
            overlay
                .save(&path)
                .with_context(|| format!("Failed to write heatmap: {:?}", path))?;
            written.push(path);
        }
        debug!("Wrote {} heatmaps for {} ({} channels)", count, tag, channels);
        Ok(written)
    }
}

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn heatmap_overlay(gray: &[f32], mask: &[f32], width: usize, height: usize) -> RgbImage {
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        let base = 0.5 * gray[i];
        Rgb([to_byte(base + 0.5 * mask[i]), to_byte(base), to_byte(base)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_scalars_are_appended() {
        let dir = TempDir::new().unwrap();
        let mut writer = SummaryWriter::new(dir.path()).unwrap();
        writer.add_scalar("train/loss", 0.5, 0).unwrap();

        let mut metrics = Metrics::new();
        metrics.insert("accuracy".into(), 0.75);
        metrics.insert("sens_positive".into(), 1.0);
        writer.add_scalars("val/", &metrics, 10).unwrap();

        let log = fs::read_to_string(dir.path().join("events/scalars.jsonl")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("\"tag\":\"val/accuracy\""));
        assert!(lines[1].contains("\"step\":10"));
    }

    #[test]
    fn test_heatmaps_written() {
        let dir = TempDir::new().unwrap();
        let mut writer = SummaryWriter::new(dir.path()).unwrap();
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 4, 4], &device);
        let masks = Tensor::<TestBackend, 4>::ones([3, 1, 4, 4], &device);

        let paths = writer
            .add_heatmaps("test/semantic/positive", images, masks, 2, 2)
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("images/test_semantic_positive_2_0.png"));

        let img = image::open(&paths[1]).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0), &Rgb([128, 0, 0]));
    }
}
