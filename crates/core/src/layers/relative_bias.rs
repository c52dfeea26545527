//! Learned pairwise bias from keypoint geometry.
//!
//! Every token carries a 5-vector `g = [x, y, scale_a, scale_b, angle]`; the
//! class token's is zero. For each ordered pair of tokens:
//!
//! ```text
//! bias[b, i, j, :] = W · (g_i − g_j) + w₀        // W: 5 → embed_dim
//! ```
//!
//! Relative position, scale and orientation are encoded jointly by one
//! linear map. The tensor is `[batch, L, L, embed_dim]` with `L = points + 1`,
//! so memory grows quadratically in the keypoint capacity.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::geometry::GEOMETRY_DIM;

pub struct RelativeGeometryBias {
    proj: Linear,
    embed_dim: usize,
}

impl RelativeGeometryBias {
    pub fn new(embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let proj = linear(GEOMETRY_DIM, embed_dim, vb.pp("proj"))?;
        Ok(Self { proj, embed_dim })
    }

    /// Apply the learned projection to `[..., 5]` geometry differences.
    pub fn project(&self, diff: &Tensor) -> Result<Tensor> {
        let dims = diff.dims().to_vec();
        let rows = diff.elem_count() / GEOMETRY_DIM;
        let out = self.proj.forward(&diff.reshape((rows, GEOMETRY_DIM))?)?;
        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.embed_dim;
        }
        out.reshape(out_dims)
    }

    /// `[batch, points, 5]` → `[batch, points + 1, points + 1, embed_dim]`.
    pub fn forward(&self, geometry: &Tensor) -> Result<Tensor> {
        let (b, _, d) = geometry.dims3()?;
        if d != GEOMETRY_DIM {
            candle_core::bail!("geometry must have {GEOMETRY_DIM} components, got {d}");
        }
        let geometry = geometry.to_dtype(self.proj.weight().dtype())?;
        let cls = Tensor::zeros((b, 1, d), geometry.dtype(), geometry.device())?;
        let tokens = Tensor::cat(&[&cls, &geometry], 1)?; // [b, L, 5]

        // diff[b, i, j] = g_i − g_j
        let diff = tokens.unsqueeze(2)?.broadcast_sub(&tokens.unsqueeze(1)?)?;
        self.project(&diff)
    }

    /// Fold the embedding axis into per-head score biases: each head sums
    /// its own `head_dim` slice, giving `[batch, heads, L, L]`.
    pub fn per_head(bias: &Tensor, num_heads: usize) -> Result<Tensor> {
        let (b, l, l2, d) = bias.dims4()?;
        if d % num_heads != 0 {
            candle_core::bail!("bias width {d} not divisible by {num_heads} heads");
        }
        bias.reshape((b, l, l2, num_heads, d / num_heads))?
            .sum(4)?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }
}
