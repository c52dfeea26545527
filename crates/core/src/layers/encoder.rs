use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use super::attention::MultiHeadSelfAttention;
use super::mlp::FeedForward;
use crate::config::KeypointViTConfig;

/// Pre-norm residual block: attention, then feed-forward.
pub struct EncoderLayer {
    attention: MultiHeadSelfAttention,
    norm1: LayerNorm,
    norm2: LayerNorm,
    mlp: FeedForward,
}

impl EncoderLayer {
    pub fn new(cfg: &KeypointViTConfig, vb: VarBuilder) -> Result<Self> {
        let attention = MultiHeadSelfAttention::new(
            cfg.embed_dim,
            cfg.num_heads,
            cfg.attn_dropout,
            vb.pp("attention"),
        )?;
        let norm1 = candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm1"))?;
        let norm2 = candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm2"))?;
        let mlp = FeedForward::new(
            cfg.embed_dim,
            cfg.mlp_hidden_dim(),
            cfg.mlp_dropout,
            vb.pp("mlp"),
        )?;

        Ok(Self {
            attention,
            norm1,
            norm2,
            mlp,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, attn_bias: Option<&Tensor>, train: bool) -> Result<Tensor> {
        // Pre-norm attention
        let residual = xs;
        let hidden = self.norm1.forward(xs)?;
        let hidden = self.attention.forward_t(&hidden, attn_bias, train)?;
        let xs = (residual + hidden)?;

        // Pre-norm MLP
        let residual = &xs;
        let hidden = self.norm2.forward(&xs)?;
        let hidden = self.mlp.forward_t(&hidden, train)?;
        residual + hidden
    }

    pub fn attention(&self) -> &MultiHeadSelfAttention {
        &self.attention
    }
}

/// `depth` encoder layers applied in order.
pub struct EncoderStack {
    layers: Vec<EncoderLayer>,
}

impl EncoderStack {
    pub fn new(cfg: &KeypointViTConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.depth)
            .map(|i| EncoderLayer::new(cfg, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward_t(&self, xs: &Tensor, attn_bias: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, attn_bias, train)?;
        }
        Ok(xs)
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }
}
