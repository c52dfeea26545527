use candle_core::{Device, Result, Tensor};

use crate::config::{DetectorKind, KeypointViTConfig, RelativeBiasMode};

/// Tiny config for testing (2 layers, 16 wide, 4 heads, 8 keypoints).
/// Uses a few thousand parameters.
pub fn tiny_config() -> KeypointViTConfig {
    KeypointViTConfig {
        img_size: 32,
        patch_size: 4,
        in_channels: 3,
        num_classes: 3,
        embed_dim: 16,
        depth: 2,
        num_heads: 4,
        max_point_num: 8,
        mlp_ratio: 2.0,
        feature_extractor: DetectorKind::Grid,
        ..KeypointViTConfig::default()
    }
}

/// [`tiny_config`] with the relative bias injected and padding masked.
pub fn tiny_inject_config() -> KeypointViTConfig {
    KeypointViTConfig {
        relative_bias: RelativeBiasMode::Inject,
        mask_padding: true,
        ..tiny_config()
    }
}

/// Smooth RGB images `[batch, 3, size, size]` with values in `[0, 1]`,
/// different per batch element and channel.
pub fn synthetic_images(batch: usize, size: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(batch * 3 * size * size);
    for b in 0..batch {
        for c in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    let phase = (b * 3 + c) as f32 * 0.7;
                    let v = ((x as f32 * 0.45 + phase).sin() * (y as f32 * 0.3).cos() + 1.0) * 0.5;
                    data.push(v);
                }
            }
        }
    }
    Tensor::from_vec(data, (batch, 3, size, size), device)
}
