//! Keypoint geometry: from detected affine frames to padded per-token
//! geometry and resampled patches.
//!
//! # Pipeline
//!
//! 1. A [`FeatureDetector`] produces a variable-length list of
//!    [`AffineFrame`]s per image.
//! 2. Each frame decomposes into a 5-vector `[x, y, scale_a, scale_b, angle]`.
//! 3. [`KeypointBatch`] packs the vectors into a `[batch, max_points, 5]`
//!    arena with per-image valid counts; padding is all-zero.
//! 4. A [`PatchResampler`] cuts one affine-normalised patch per slot.

mod batch;
mod detector;
mod frame;
mod resample;

pub use batch::KeypointBatch;
pub use detector::{
    detect_rgb, detector_from_config, rgb_to_grayscale, FeatureDetector, GridDetector,
    HarrisDetector,
};
pub use frame::{decompose_frames, frames_from_tensor, AffineFrame, KeypointGeometry, GEOMETRY_DIM};
pub use resample::{bilinear_sample, BilinearPatchResampler, PatchResampler};
