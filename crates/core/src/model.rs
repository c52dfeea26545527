//! Keypoint Vision Transformer.
//!
//! Tokens are patches cut at detected keypoints rather than a fixed grid:
//!
//! ```text
//! frames ─► geometry [B, P, 5] ─► patches [B, P, S, S, C] ─► tokens [B, P, E]
//!        cls ⊕ tokens ─► dropout ─► encoder ─► norm ─► head(x[:, 0]) ─► logits
//! geometry ─► relative bias [B, L, L, E]   (L = P + 1)
//! ```
//!
//! The relative bias is always computed. Whether it reaches the attention
//! scores is controlled by [`RelativeBiasMode`].

use candle_core::{DType, IndexOp, Module, Tensor};
use candle_nn::{linear, Dropout, Init, LayerNorm, Linear, VarBuilder};

use crate::config::{KeypointViTConfig, RelativeBiasMode};
use crate::error::{Result, ViTError};
use crate::geometry::{
    detect_rgb, detector_from_config, BilinearPatchResampler, FeatureDetector,
    KeypointBatch, PatchResampler, GEOMETRY_DIM,
};
use crate::layers::{key_padding_mask, EncoderStack, PatchEmbedder, RelativeGeometryBias};

pub struct KeypointViT {
    config: KeypointViTConfig,
    detector: Box<dyn FeatureDetector>,
    resampler: Box<dyn PatchResampler>,
    patch_to_vector: PatchEmbedder,
    cls_token: Tensor,
    pos_embed: RelativeGeometryBias,
    pos_drop: Dropout,
    encoder: EncoderStack,
    norm: LayerNorm,
    head: Linear,
}

impl KeypointViT {
    /// Build with the detector selected by `cfg.feature_extractor` and the
    /// bilinear resampler.
    pub fn new(cfg: &KeypointViTConfig, vb: VarBuilder) -> Result<Self> {
        Self::with_components(
            cfg,
            detector_from_config(cfg),
            Box::new(BilinearPatchResampler),
            vb,
        )
    }

    /// Build with explicitly injected collaborators.
    pub fn with_components(
        cfg: &KeypointViTConfig,
        detector: Box<dyn FeatureDetector>,
        resampler: Box<dyn PatchResampler>,
        vb: VarBuilder,
    ) -> Result<Self> {
        cfg.validate()?;

        let patch_to_vector = PatchEmbedder::new(
            cfg.in_channels,
            cfg.patch_size,
            cfg.embed_dim,
            vb.pp("patch_to_vector"),
        )?;
        let cls_token = vb.get_with_hints((1, 1, cfg.embed_dim), "cls_token", Init::Const(0.))?;
        let pos_embed = RelativeGeometryBias::new(cfg.embed_dim, vb.pp("pos_embed"))?;
        let encoder = EncoderStack::new(cfg, vb.pp("encoder_layers"))?;
        let norm = candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm"))?;
        let head = linear(cfg.embed_dim, cfg.num_classes, vb.pp("head"))?;

        tracing::info!(
            embed_dim = cfg.embed_dim,
            depth = cfg.depth,
            num_heads = cfg.num_heads,
            max_point_num = cfg.max_point_num,
            patch_size = cfg.patch_size,
            relative_bias = ?cfg.relative_bias,
            mask_padding = cfg.mask_padding,
            detector = detector.name(),
            "built keypoint ViT"
        );

        Ok(Self {
            config: cfg.clone(),
            detector,
            resampler,
            patch_to_vector,
            cls_token,
            pos_embed,
            pos_drop: Dropout::new(cfg.token_dropout),
            encoder,
            norm,
            head,
        })
    }

    /// Logits `[batch, num_classes]` for `images` `[batch, C, H, W]` and
    /// their keypoints. Dropout is active only when `train` is set.
    pub fn forward(&self, images: &Tensor, keypoints: &KeypointBatch, train: bool) -> Result<Tensor> {
        let xs = self.encode(images, keypoints, train)?;
        let cls = xs.i((.., 0))?;
        Ok(self.head.forward(&cls)?)
    }

    /// Frames given as a `(B, P, 2, 3)` tensor, optionally
    /// with the number of real frames per image.
    pub fn forward_lafs(
        &self,
        images: &Tensor,
        lafs: &Tensor,
        counts: Option<&[usize]>,
        train: bool,
    ) -> Result<Tensor> {
        let dims = lafs.dims();
        if dims.len() != 4 || dims[2] != 2 || dims[3] != 3 {
            return Err(ViTError::InvalidShape {
                name: "lafs",
                expected: "(batch, points, 2, 3)",
                got: dims.to_vec(),
            });
        }
        let keypoints = KeypointBatch::from_laf_tensor(lafs, counts, self.config.max_point_num)?;
        self.forward(images, &keypoints, train)
    }

    /// Detect keypoints with the owned detector, then run [`forward`](Self::forward).
    pub fn forward_images(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let keypoints = self.detect(images)?;
        self.forward(images, &keypoints, train)
    }

    /// Run the owned detector on an RGB batch.
    pub fn detect(&self, images: &Tensor) -> Result<KeypointBatch> {
        self.check_images(images)?;
        let frames = detect_rgb(self.detector.as_ref(), images)?;
        Ok(KeypointBatch::from_frames(
            &frames,
            self.config.max_point_num,
            images.device(),
        )?)
    }

    /// Final normalised token sequence `[batch, 1 + max_point_num, embed_dim]`.
    pub fn encode(&self, images: &Tensor, keypoints: &KeypointBatch, train: bool) -> Result<Tensor> {
        let (batch, _, _, _) = self.check_images(images)?;
        self.check_keypoints(batch, keypoints)?;

        let dtype = images.dtype();
        let geometry = keypoints
            .geometry()
            .to_device(images.device())?
            .to_dtype(dtype)?;

        tracing::debug!(
            batch,
            valid = ?keypoints.valid_counts(),
            capacity = keypoints.capacity(),
            "keypoint ViT forward"
        );

        let tokens = self.embed_tokens(images, keypoints, &geometry)?;
        let tokens = self.pos_drop.forward(&tokens, train)?;

        let attn_bias = self.attention_bias(keypoints, &geometry)?;
        let xs = self.encoder.forward_t(&tokens, attn_bias.as_ref(), train)?;
        Ok(self.norm.forward(&xs)?)
    }

    /// Class token followed by one embedded patch per keypoint slot.
    fn embed_tokens(
        &self,
        images: &Tensor,
        keypoints: &KeypointBatch,
        geometry: &Tensor,
    ) -> Result<Tensor> {
        let (batch, points, _) = geometry.dims3()?;
        let centers = geometry.narrow(2, 0, 2)?;
        let half_axes = (geometry.narrow(2, 2, 2)? * 0.5)?;
        let angles = geometry.narrow(2, 4, 1)?.squeeze(2)?;

        let patches = self.resampler.resample(
            images,
            &centers,
            &half_axes,
            &angles,
            self.config.patch_size,
        )?;
        // Padding slots carry zero patch content.
        let valid = keypoints
            .point_mask(patches.dtype())?
            .to_device(images.device())?
            .reshape((batch, points, 1, 1, 1))?;
        let patches = patches.broadcast_mul(&valid)?;

        let tokens = self.patch_to_vector.forward(&patches)?;
        let cls = self
            .cls_token
            .to_dtype(tokens.dtype())?
            .broadcast_as((batch, 1, self.config.embed_dim))?;
        Ok(Tensor::cat(&[&cls, &tokens], 1)?)
    }

    /// Additive score bias for every encoder layer, if any.
    fn attention_bias(&self, keypoints: &KeypointBatch, geometry: &Tensor) -> Result<Option<Tensor>> {
        let relative = self.pos_embed.forward(geometry)?;

        let mut bias = match self.config.relative_bias {
            RelativeBiasMode::ComputeOnly => None,
            RelativeBiasMode::Inject => Some(RelativeGeometryBias::per_head(
                &relative,
                self.config.num_heads,
            )?),
        };

        if self.config.mask_padding {
            let mask = key_padding_mask(
                keypoints.valid_counts(),
                keypoints.capacity(),
                relative.dtype(),
                geometry.device(),
            )?;
            bias = Some(match bias {
                Some(bias) => bias.broadcast_add(&mask)?,
                None => mask,
            });
        }
        Ok(bias)
    }

    /// Pairwise geometry bias `[batch, L, L, embed_dim]` for `keypoints`.
    pub fn relative_bias(&self, keypoints: &KeypointBatch) -> Result<Tensor> {
        let geometry = keypoints
            .geometry()
            .to_device(self.cls_token.device())?
            .to_dtype(self.cls_token.dtype())?;
        Ok(self.pos_embed.forward(&geometry)?)
    }

    fn check_images(&self, images: &Tensor) -> Result<(usize, usize, usize, usize)> {
        let dims = images.dims();
        if dims.len() != 4 {
            return Err(ViTError::InvalidShape {
                name: "images",
                expected: "(batch, channels, height, width)",
                got: dims.to_vec(),
            });
        }
        if dims[2] == 0 || dims[3] == 0 {
            return Err(ViTError::InvalidShape {
                name: "images",
                expected: "non-empty (height, width)",
                got: dims.to_vec(),
            });
        }
        if dims[1] != self.config.in_channels {
            return Err(ViTError::ChannelMismatch {
                expected: self.config.in_channels,
                got: dims[1],
            });
        }
        Ok((dims[0], dims[1], dims[2], dims[3]))
    }

    fn check_keypoints(&self, batch: usize, keypoints: &KeypointBatch) -> Result<()> {
        if keypoints.batch_size() != batch {
            return Err(ViTError::BatchMismatch {
                images: batch,
                keypoints: keypoints.batch_size(),
            });
        }
        if keypoints.capacity() != self.config.max_point_num {
            return Err(ViTError::InvalidShape {
                name: "keypoints",
                expected: "(batch, max_point_num, 5)",
                got: vec![keypoints.batch_size(), keypoints.capacity(), GEOMETRY_DIM],
            });
        }
        Ok(())
    }

    pub fn config(&self) -> &KeypointViTConfig {
        &self.config
    }

    pub fn detector(&self) -> &dyn FeatureDetector {
        self.detector.as_ref()
    }

    pub fn encoder(&self) -> &EncoderStack {
        &self.encoder
    }

    pub fn dtype(&self) -> DType {
        self.cls_token.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::AffineFrame;
    use crate::testing::{synthetic_images, tiny_config, tiny_inject_config};
    use candle_core::Device;
    use candle_nn::VarMap;

    fn random_model(cfg: &KeypointViTConfig) -> (VarMap, KeypointViT) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = KeypointViT::new(cfg, vb).unwrap();
        (varmap, model)
    }

    fn frames(n: usize, offset: f32) -> Vec<AffineFrame> {
        (0..n)
            .map(|i| {
                let x = 4.0 + (i % 6) as f32 * 4.5 + offset;
                let y = 4.0 + (i / 6) as f32 * 4.5;
                AffineFrame::oriented([x, y], 3.0 + i as f32 * 0.2, 2.0, 0.3 * i as f32)
            })
            .collect()
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn logits_have_class_shape() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let images = synthetic_images(2, cfg.img_size, &Device::Cpu).unwrap();
        let batch = KeypointBatch::from_frames(&[frames(3, 0.0), frames(5, 1.0)], 8, &Device::Cpu).unwrap();

        let logits = model.forward(&images, &batch, false).unwrap();
        assert_eq!(logits.dims(), &[2, cfg.num_classes]);
    }

    #[test]
    fn zero_keypoints_still_use_full_sequence() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let images = synthetic_images(2, cfg.img_size, &Device::Cpu).unwrap();
        let batch = KeypointBatch::from_frames(&[vec![], vec![]], 8, &Device::Cpu).unwrap();

        let tokens = model.encode(&images, &batch, false).unwrap();
        assert_eq!(tokens.dims(), &[2, cfg.seq_len(), cfg.embed_dim]);
        let logits = model.forward(&images, &batch, false).unwrap();
        assert!(to_vec(&logits).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn inference_is_idempotent() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let images = synthetic_images(1, cfg.img_size, &Device::Cpu).unwrap();
        let batch = KeypointBatch::from_frames(&[frames(6, 0.5)], 8, &Device::Cpu).unwrap();

        let a = to_vec(&model.forward(&images, &batch, false).unwrap());
        let b = to_vec(&model.forward(&images, &batch, false).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn excess_keypoints_are_truncated_in_order() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let images = synthetic_images(1, cfg.img_size, &Device::Cpu).unwrap();
        let all = frames(12, 0.0);

        let overflow = KeypointBatch::from_frames(&[all.clone()], 8, &Device::Cpu).unwrap();
        assert_eq!(overflow.valid_counts(), &[8]);
        let first = KeypointBatch::from_frames(&[all[..8].to_vec()], 8, &Device::Cpu).unwrap();

        let a = to_vec(&model.forward(&images, &overflow, false).unwrap());
        let b = to_vec(&model.forward(&images, &first, false).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn compute_only_ignores_bias_weights() {
        let cfg = tiny_config();
        let (mut varmap, model) = random_model(&cfg);
        let images = synthetic_images(1, cfg.img_size, &Device::Cpu).unwrap();
        let batch = KeypointBatch::from_frames(&[frames(4, 0.0)], 8, &Device::Cpu).unwrap();

        let before = to_vec(&model.forward(&images, &batch, false).unwrap());
        let weight = Tensor::randn(0f32, 5.0, (cfg.embed_dim, GEOMETRY_DIM), &Device::Cpu).unwrap();
        varmap.set_one("pos_embed.proj.weight", weight).unwrap();
        let after = to_vec(&model.forward(&images, &batch, false).unwrap());
        assert_eq!(before, after);
    }

    #[test]
    fn inject_mode_uses_bias_weights() {
        let cfg = tiny_inject_config();
        let (mut varmap, model) = random_model(&cfg);
        let images = synthetic_images(1, cfg.img_size, &Device::Cpu).unwrap();
        let batch = KeypointBatch::from_frames(&[frames(4, 0.0)], 8, &Device::Cpu).unwrap();

        let before = to_vec(&model.forward(&images, &batch, false).unwrap());
        let weight = Tensor::randn(0f32, 5.0, (cfg.embed_dim, GEOMETRY_DIM), &Device::Cpu).unwrap();
        varmap.set_one("pos_embed.proj.weight", weight).unwrap();
        let after = to_vec(&model.forward(&images, &batch, false).unwrap());
        assert_ne!(before, after);
    }

    #[test]
    fn masked_padding_makes_logits_capacity_independent() {
        // Parameters do not depend on the keypoint capacity, so two models
        // sharing one VarMap differ only in how much padding they see.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut cfg = tiny_config();
        cfg.mask_padding = true;
        let small = KeypointViT::new(&cfg, vb.clone()).unwrap();
        cfg.max_point_num = 16;
        let large = KeypointViT::new(&cfg, vb).unwrap();

        let images = synthetic_images(1, cfg.img_size, &Device::Cpu).unwrap();
        let list = frames(3, 0.0);
        let a = KeypointBatch::from_frames(&[list.clone()], 8, &Device::Cpu).unwrap();
        let b = KeypointBatch::from_frames(&[list], 16, &Device::Cpu).unwrap();

        let a = to_vec(&small.forward(&images, &a, false).unwrap());
        let b = to_vec(&large.forward(&images, &b, false).unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn rejects_wrong_channels_and_batch() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let batch = KeypointBatch::from_frames(&[frames(2, 0.0)], 8, &Device::Cpu).unwrap();

        let gray = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&gray, &batch, false),
            Err(ViTError::ChannelMismatch { expected: 3, got: 1 })
        ));

        let two = synthetic_images(2, 32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&two, &batch, false),
            Err(ViTError::BatchMismatch { images: 2, keypoints: 1 })
        ));

        let small = KeypointBatch::from_frames(&[frames(2, 0.0)], 4, &Device::Cpu).unwrap();
        let one = synthetic_images(1, 32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&one, &small, false),
            Err(ViTError::InvalidShape { name: "keypoints", .. })
        ));
    }

    #[test]
    fn rejects_empty_images() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let batch = KeypointBatch::from_frames(&[frames(2, 0.0)], 8, &Device::Cpu).unwrap();

        for (h, w) in [(0, 32), (32, 0)] {
            let empty = Tensor::zeros((1, 3, h, w), DType::F32, &Device::Cpu).unwrap();
            assert!(matches!(
                model.forward(&empty, &batch, false),
                Err(ViTError::InvalidShape { name: "images", .. })
            ));
        }
    }

    #[test]
    fn relative_bias_follows_model_dtype() {
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        let model = KeypointViT::new(&cfg, vb).unwrap();
        assert_eq!(model.dtype(), DType::F64);

        let batch = KeypointBatch::from_frames(&[frames(3, 0.0)], 8, &Device::Cpu).unwrap();
        let bias = model.relative_bias(&batch).unwrap();
        assert_eq!(bias.dtype(), DType::F64);
        assert!(bias.device().same_device(&Device::Cpu));
        assert_eq!(bias.dims(), &[1, 9, 9, cfg.embed_dim]);
    }

    #[test]
    fn invalid_config_fails_construction() {
        let mut cfg = tiny_config();
        cfg.num_heads = 3;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            KeypointViT::new(&cfg, vb),
            Err(ViTError::InvalidConfig(_))
        ));
    }

    #[test]
    fn laf_entry_point_matches_batch_entry_point() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let images = synthetic_images(1, cfg.img_size, &Device::Cpu).unwrap();
        let list = frames(5, 0.0);

        let rows: Vec<f32> = list.iter().flat_map(|f| f.to_rows().concat()).collect();
        let lafs = Tensor::from_vec(rows, (1, 5, 2, 3), &Device::Cpu).unwrap();
        let batch = KeypointBatch::from_frames(&[list], 8, &Device::Cpu).unwrap();

        let a = to_vec(&model.forward_lafs(&images, &lafs, None, false).unwrap());
        let b = to_vec(&model.forward(&images, &batch, false).unwrap());
        assert_eq!(a, b);

        let bad = Tensor::zeros((1, 5, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward_lafs(&images, &bad, None, false),
            Err(ViTError::InvalidShape { name: "lafs", .. })
        ));
    }

    #[test]
    fn image_entry_point_runs_detector() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        assert_eq!(model.detector().name(), "grid");
        let images = synthetic_images(2, cfg.img_size, &Device::Cpu).unwrap();

        let detected = model.detect(&images).unwrap();
        assert_eq!(detected.valid_counts(), &[8, 8]);
        let logits = model.forward_images(&images, false).unwrap();
        assert_eq!(logits.dims(), &[2, cfg.num_classes]);
    }

    #[test]
    fn relative_bias_matches_keypoint_count() {
        let cfg = tiny_config();
        let (_varmap, model) = random_model(&cfg);
        let batch = KeypointBatch::from_frames(&[frames(2, 0.0)], 8, &Device::Cpu).unwrap();
        let bias = model.relative_bias(&batch).unwrap();
        assert_eq!(bias.dims(), &[1, 9, 9, cfg.embed_dim]);
    }
}
