use candle_core::{DType, Device, Result, Tensor};

use super::frame::{decompose_frames, frames_from_tensor, AffineFrame, KeypointGeometry, GEOMETRY_DIM};

/// Fixed-capacity keypoint arena for a batch of images.
///
/// Every image owns `capacity` slots; the first `valid_counts[b]` hold real
/// keypoints and the rest carry zero geometry. Detections beyond the
/// capacity are dropped, keeping detector order.
#[derive(Debug, Clone)]
pub struct KeypointBatch {
    /// `[batch, capacity, 5]`, f32.
    geometry: Tensor,
    valid_counts: Vec<usize>,
    capacity: usize,
}

impl KeypointBatch {
    /// Decompose per-image frames and pad them to `capacity`.
    pub fn from_frames(frames: &[Vec<AffineFrame>], capacity: usize, device: &Device) -> Result<Self> {
        let geometry: Vec<Vec<KeypointGeometry>> = frames
            .iter()
            .map(|f| decompose_frames(&f[..f.len().min(capacity)]))
            .collect();
        Self::pack(&geometry, frames.iter().map(Vec::len), capacity, device)
    }

    /// Pad already-decomposed geometry to `capacity`.
    pub fn from_geometry(
        geometry: &[Vec<KeypointGeometry>],
        capacity: usize,
        device: &Device,
    ) -> Result<Self> {
        Self::pack(geometry, geometry.iter().map(Vec::len), capacity, device)
    }

    /// Build from a `(B, P, 2, 3)` frame tensor with optional per-image counts.
    pub fn from_laf_tensor(lafs: &Tensor, counts: Option<&[usize]>, capacity: usize) -> Result<Self> {
        let frames = frames_from_tensor(lafs, counts)?;
        Self::from_frames(&frames, capacity, lafs.device())
    }

    fn pack(
        geometry: &[Vec<KeypointGeometry>],
        detected: impl Iterator<Item = usize>,
        capacity: usize,
        device: &Device,
    ) -> Result<Self> {
        let batch = geometry.len();
        let mut data = vec![0f32; batch * capacity * GEOMETRY_DIM];
        let mut valid_counts = Vec::with_capacity(batch);

        for (b, (points, found)) in geometry.iter().zip(detected).enumerate() {
            let kept = points.len().min(capacity);
            if found > capacity {
                tracing::debug!(image = b, detected = found, capacity, "truncating keypoints");
            }
            for (p, g) in points.iter().take(kept).enumerate() {
                let offset = (b * capacity + p) * GEOMETRY_DIM;
                data[offset..offset + GEOMETRY_DIM].copy_from_slice(&g.to_array());
            }
            valid_counts.push(kept);
        }

        let geometry = Tensor::from_vec(data, (batch, capacity, GEOMETRY_DIM), device)?;
        Ok(Self {
            geometry,
            valid_counts,
            capacity,
        })
    }

    /// Padded geometry, `[batch, capacity, 5]`.
    pub fn geometry(&self) -> &Tensor {
        &self.geometry
    }

    pub fn valid_counts(&self) -> &[usize] {
        &self.valid_counts
    }

    pub fn batch_size(&self) -> usize {
        self.valid_counts.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn device(&self) -> &Device {
        self.geometry.device()
    }

    /// 1 for real keypoints, 0 for padding: `[batch, capacity]`.
    pub fn point_mask(&self, dtype: DType) -> Result<Tensor> {
        let mask = self.mask_rows(false);
        Tensor::from_vec(mask, (self.batch_size(), self.capacity), self.device())?.to_dtype(dtype)
    }

    /// Same as [`point_mask`](Self::point_mask) with the always-valid class
    /// token prepended: `[batch, 1 + capacity]`.
    pub fn token_mask(&self, dtype: DType) -> Result<Tensor> {
        let mask = self.mask_rows(true);
        Tensor::from_vec(mask, (self.batch_size(), self.capacity + 1), self.device())?
            .to_dtype(dtype)
    }

    fn mask_rows(&self, with_class_token: bool) -> Vec<f32> {
        let lead = usize::from(with_class_token);
        self.valid_counts
            .iter()
            .flat_map(|&n| {
                (0..lead + self.capacity).map(move |i| if i < lead + n { 1.0 } else { 0.0 })
            })
            .collect()
    }
}
