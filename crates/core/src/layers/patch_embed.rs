use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

/// Maps each resampled patch to one embedding vector.
///
/// A stride-1 convolution whose kernel covers the whole patch, so each patch
/// collapses to a single `1×1` output: a dense linear map over its pixels.
/// Patches never interact here.
pub struct PatchEmbedder {
    proj: Conv2d,
    in_channels: usize,
    patch_size: usize,
    embed_dim: usize,
}

impl PatchEmbedder {
    pub fn new(
        in_channels: usize,
        patch_size: usize,
        embed_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let proj = candle_nn::conv2d(
            in_channels,
            embed_dim,
            patch_size,
            Conv2dConfig {
                stride: 1,
                padding: 0,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self {
            proj,
            in_channels,
            patch_size,
            embed_dim,
        })
    }

    /// `[batch, points, size, size, channels]` → `[batch, points, embed_dim]`.
    pub fn forward(&self, patches: &Tensor) -> Result<Tensor> {
        let (b, p, h, w, c) = patches.dims5()?;
        if h != self.patch_size || w != self.patch_size || c != self.in_channels {
            candle_core::bail!(
                "patch embedder expects {0}x{0}x{1} patches, got {h}x{w}x{c}",
                self.patch_size,
                self.in_channels
            );
        }

        // NHWC → NCHW, keypoints folded into the batch
        let xs = patches
            .permute((0, 1, 4, 2, 3))?
            .reshape((b * p, c, h, w))?;
        let xs = self.proj.forward(&xs)?; // [b * p, embed_dim, 1, 1]
        xs.reshape((b, p, self.embed_dim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn embeds_every_patch() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let embed = PatchEmbedder::new(3, 8, 32, vb).unwrap();

        let patches = Tensor::randn(0f32, 1.0, (2, 5, 8, 8, 3), &device).unwrap();
        let out = embed.forward(&patches).unwrap();
        assert_eq!(out.dims(), &[2, 5, 32]);
    }

    #[test]
    fn rejects_wrong_patch_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let embed = PatchEmbedder::new(3, 8, 32, vb).unwrap();

        let wrong_size = Tensor::zeros((1, 2, 4, 4, 3), DType::F32, &device).unwrap();
        assert!(embed.forward(&wrong_size).is_err());
        let wrong_channels = Tensor::zeros((1, 2, 8, 8, 1), DType::F32, &device).unwrap();
        assert!(embed.forward(&wrong_channels).is_err());
    }

    #[test]
    fn patches_are_embedded_independently() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = PatchEmbedder::new(3, 4, 16, vb).unwrap();

        let patches = Tensor::randn(0f32, 1.0, (1, 3, 4, 4, 3), &device).unwrap();
        let together = embed.forward(&patches).unwrap();

        let alone = embed.forward(&patches.narrow(1, 1, 1).unwrap()).unwrap();
        let diff = (together.i((0, 1)).unwrap() - alone.i((0, 0)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn zero_patch_maps_to_conv_bias() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = PatchEmbedder::new(3, 4, 8, vb).unwrap();

        let zeros = Tensor::zeros((1, 1, 4, 4, 3), DType::F32, &device).unwrap();
        let out: Vec<f32> = embed.forward(&zeros).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let bias: Vec<f32> = embed.proj.bias().unwrap().to_vec1().unwrap();
        assert_eq!(out, bias);
    }
}
