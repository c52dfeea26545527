//! Vision transformer over keypoint tokens.
//!
//! Instead of a uniform patch grid, tokens are affine-normalised patches cut
//! at detected keypoints. Each token keeps its position, scale and
//! orientation, and a learned pairwise bias encodes the geometry between
//! tokens.

pub mod config;
pub mod error;
pub mod geometry;
pub mod layers;
pub mod loader;
pub mod model;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{DetectorKind, DeviceSpec, KeypointViTConfig, RelativeBiasMode};
pub use error::{Result, ViTError};
pub use geometry::{AffineFrame, KeypointBatch, KeypointGeometry};
pub use model::KeypointViT;
