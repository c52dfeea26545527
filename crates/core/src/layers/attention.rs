use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

/// Multi-head scaled dot-product self-attention with a fused QKV projection.
pub struct MultiHeadSelfAttention {
    qkv: Linear,
    proj: Linear,
    attn_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadSelfAttention {
    /// Fails when `embed_dim` does not split evenly across heads.
    pub fn new(embed_dim: usize, num_heads: usize, attn_dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle_core::bail!(
                "embed_dim ({embed_dim}) must be divisible by num_heads ({num_heads})"
            );
        }
        let head_dim = embed_dim / num_heads;
        let qkv = linear(embed_dim, embed_dim * 3, vb.pp("qkv"))?;
        let proj = linear(embed_dim, embed_dim, vb.pp("proj"))?;

        Ok(Self {
            qkv,
            proj,
            attn_drop: Dropout::new(attn_dropout),
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Split into q, k, v, each `[batch, heads, seq, head_dim]`.
    fn project_qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, n, _) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        Ok((
            qkv.i(0)?.contiguous()?,
            qkv.i(1)?.contiguous()?,
            qkv.i(2)?.contiguous()?,
        ))
    }

    fn weights(&self, q: &Tensor, k: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = match bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };
        candle_nn::ops::softmax_last_dim(&scores)
    }

    /// Normalised attention weights `[batch, heads, seq, seq]` before dropout.
    ///
    /// `bias` is added to the scaled scores and must broadcast to that shape.
    pub fn attention_weights(&self, xs: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (q, k, _) = self.project_qkv(xs)?;
        self.weights(&q, &k, bias)
    }

    /// `[batch, seq, embed_dim]` → same shape. Dropout on the weights only
    /// when `train` is set.
    pub fn forward_t(&self, xs: &Tensor, bias: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let (q, k, v) = self.project_qkv(xs)?;

        let attn = self.weights(&q, &k, bias)?;
        let attn = self.attn_drop.forward(&attn, train)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&out)
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
