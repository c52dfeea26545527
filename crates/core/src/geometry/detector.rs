//! Keypoint detectors producing local affine frames.
//!
//! The model only depends on the [`FeatureDetector`] capability; the
//! concrete detector is chosen from [`DetectorKind`] at construction and
//! lives as long as the model. Detectors never train and hold no
//! per-call state.

use candle_core::{DType, Result, Tensor};

use super::frame::AffineFrame;
use crate::config::{DetectorKind, KeypointViTConfig};

/// Capability: given a grayscale image, produce affine frames.
pub trait FeatureDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detect keypoints in one grayscale image `[height, width]`.
    fn detect(&self, image: &Tensor) -> Result<Vec<AffineFrame>>;

    /// Detect keypoints in a grayscale batch `[batch, 1, height, width]`.
    fn detect_batch(&self, images: &Tensor) -> Result<Vec<Vec<AffineFrame>>> {
        let (batch, channels, _, _) = images.dims4()?;
        if channels != 1 {
            candle_core::bail!("detectors expect grayscale input, got {channels} channels");
        }
        (0..batch)
            .map(|b| self.detect(&images.get(b)?.squeeze(0)?))
            .collect()
    }
}

/// Instantiate the detector selected in the config.
pub fn detector_from_config(cfg: &KeypointViTConfig) -> Box<dyn FeatureDetector> {
    match cfg.feature_extractor {
        DetectorKind::Grid => Box::new(GridDetector::new(cfg.max_point_num, cfg.patch_size)),
        DetectorKind::Harris => {
            Box::new(HarrisDetector::new(cfg.max_point_num, cfg.patch_size as f32))
        }
    }
}

/// ITU-R 601 luma: `[batch, 3, h, w]` → `[batch, 1, h, w]`.
pub fn rgb_to_grayscale(images: &Tensor) -> Result<Tensor> {
    let (_, channels, _, _) = images.dims4()?;
    if channels != 3 {
        candle_core::bail!("rgb_to_grayscale expects 3 channels, got {channels}");
    }
    let weights = Tensor::new(&[0.299f32, 0.587, 0.114], images.device())?
        .to_dtype(images.dtype())?
        .reshape((1, 3, 1, 1))?;
    images.broadcast_mul(&weights)?.sum_keepdim(1)
}

// ─── Grid ────────────────────────────────────────────────────────────────────

/// Isotropic, unrotated frames centred on a regular lattice, row-major.
#[derive(Debug, Clone)]
pub struct GridDetector {
    max_points: usize,
    stride: usize,
}

impl GridDetector {
    pub fn new(max_points: usize, stride: usize) -> Self {
        Self {
            max_points,
            stride: stride.max(1),
        }
    }
}

impl FeatureDetector for GridDetector {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn detect(&self, image: &Tensor) -> Result<Vec<AffineFrame>> {
        let (height, width) = image.dims2()?;
        let half = self.stride as f32 / 2.0;
        let rows = height / self.stride;
        let cols = width / self.stride;

        let frames = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .take(self.max_points)
            .map(|(r, c)| {
                let center = [
                    (c * self.stride) as f32 + half,
                    (r * self.stride) as f32 + half,
                ];
                AffineFrame::isotropic(center, self.stride as f32, 0.0)
            })
            .collect();
        Ok(frames)
    }
}

// ─── Harris ──────────────────────────────────────────────────────────────────

const SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];
const SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];

/// Harris corners whose frames follow the local second-moment matrix.
///
/// The frame axis across the dominant gradient shrinks and the axis along
/// it grows by `sqrt(λ₂/λ₁)`, clamped to `min_ratio`, keeping the area of a
/// `base_scale` circle.
#[derive(Debug, Clone)]
pub struct HarrisDetector {
    max_points: usize,
    base_scale: f32,
    window: usize,
    k: f32,
    min_ratio: f32,
}

impl HarrisDetector {
    pub fn new(max_points: usize, base_scale: f32) -> Self {
        Self {
            max_points,
            base_scale,
            window: 5,
            k: 0.04,
            min_ratio: 0.25,
        }
    }

    /// Box window used to integrate the structure tensor (odd, >= 3).
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = (window.max(3)) | 1;
        self
    }

    fn structure_tensor(&self, image: &Tensor) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>)> {
        let (height, width) = image.dims2()?;
        let device = image.device();
        let x = image.to_dtype(DType::F32)?.reshape((1, 1, height, width))?;

        let kernel = |k: &[f32; 9]| Tensor::from_slice(k, (1, 1, 3, 3), device);
        let ix = x.conv2d(&kernel(&SOBEL_X)?, 1, 1, 1, 1)?;
        let iy = x.conv2d(&kernel(&SOBEL_Y)?, 1, 1, 1, 1)?;

        let area = (self.window * self.window) as f64;
        let window = (Tensor::ones((1, 1, self.window, self.window), DType::F32, device)? / area)?;
        let pad = self.window / 2;
        let smooth = |t: Tensor| -> Result<Vec<f32>> {
            t.conv2d(&window, pad, 1, 1, 1)?.flatten_all()?.to_vec1::<f32>()
        };

        Ok((
            smooth(ix.sqr()?)?,
            smooth(iy.sqr()?)?,
            smooth(ix.mul(&iy)?)?,
        ))
    }

    fn frame_at(&self, x: usize, y: usize, sxx: f32, syy: f32, sxy: f32) -> AffineFrame {
        let half_trace = 0.5 * (sxx + syy);
        let half_diff = 0.5 * (sxx - syy);
        let radius = (half_diff * half_diff + sxy * sxy).sqrt();
        let major = half_trace + radius;
        let minor = (half_trace - radius).max(0.0);

        let ratio = if major > 0.0 {
            (minor / major).sqrt().clamp(self.min_ratio, 1.0)
        } else {
            1.0
        };
        let gradient_angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        let along = self.base_scale / ratio.sqrt();
        let across = self.base_scale * ratio.sqrt();

        AffineFrame::oriented(
            [x as f32, y as f32],
            along,
            across,
            gradient_angle + std::f32::consts::FRAC_PI_2,
        )
    }
}

impl FeatureDetector for HarrisDetector {
    fn name(&self) -> &'static str {
        "harris"
    }

    fn detect(&self, image: &Tensor) -> Result<Vec<AffineFrame>> {
        let (height, width) = image.dims2()?;
        if height < 3 || width < 3 || self.max_points == 0 {
            return Ok(Vec::new());
        }
        let (sxx, syy, sxy) = self.structure_tensor(image)?;
        let response: Vec<f32> = sxx
            .iter()
            .zip(&syy)
            .zip(&sxy)
            .map(|((&a, &b), &c)| a * b - c * c - self.k * (a + b) * (a + b))
            .collect();

        let mut peaks = Vec::new();
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let r = response[y * width + x];
                if r <= 0.0 {
                    continue;
                }
                let is_max = (y - 1..=y + 1)
                    .flat_map(|ny| (x - 1..=x + 1).map(move |nx| ny * width + nx))
                    .all(|i| response[i] <= r);
                if is_max {
                    peaks.push((r, x, y));
                }
            }
        }
        peaks.sort_by(|a, b| b.0.total_cmp(&a.0));
        peaks.truncate(self.max_points);

        Ok(peaks
            .into_iter()
            .map(|(_, x, y)| {
                let i = y * width + x;
                self.frame_at(x, y, sxx[i], syy[i], sxy[i])
            })
            .collect())
    }
}

/// Run `detector` on an RGB batch `[batch, 3, h, w]`.
pub fn detect_rgb(detector: &dyn FeatureDetector, images: &Tensor) -> Result<Vec<Vec<AffineFrame>>> {
    detector.detect_batch(&rgb_to_grayscale(images)?)
}
