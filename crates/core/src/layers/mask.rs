use candle_core::{DType, Device, Result, Tensor};

/// Additive key mask hiding padded keypoint tokens.
///
/// Token 0 (class) and the first `valid_counts[b]` keypoint tokens get 0,
/// padding gets `-inf`. Returns shape `[batch, 1, 1, 1 + capacity]`.
pub fn key_padding_mask(
    valid_counts: &[usize],
    capacity: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let seq_len = capacity + 1;
    let mask: Vec<f32> = valid_counts
        .iter()
        .flat_map(|&n| {
            (0..seq_len).map(move |j| if j <= n { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (valid_counts.len(), 1, 1, seq_len), device)?;
    mask.to_dtype(dtype)
}
