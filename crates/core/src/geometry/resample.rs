//! Affine-normalised patch extraction at keypoints.
//!
//! Each output pixel `(r, c)` of a `size × size` patch maps to the image
//! point
//!
//! ```text
//! u = −1 + (2c + 1)/size,  v = −1 + (2r + 1)/size
//! p = center + R(angle) · [half_a·u, half_b·v]
//! ```
//!
//! so the patch spans the frame's ellipse, rotated to a canonical
//! orientation. Image coordinates put pixel centres on integers; samples
//! outside the image read zero.

use candle_core::{DType, Result, Tensor};

/// Extracts one square patch per keypoint.
pub trait PatchResampler: Send + Sync {
    /// * `images` - `[batch, channels, height, width]`
    /// * `centers` - `[batch, points, 2]` as `(x, y)` pixels
    /// * `half_axes` - `[batch, points, 2]` half lengths of the two axes
    /// * `angles` - `[batch, points]` radians
    ///
    /// Returns `[batch, points, size, size, channels]`.
    fn resample(
        &self,
        images: &Tensor,
        centers: &Tensor,
        half_axes: &Tensor,
        angles: &Tensor,
        size: usize,
    ) -> Result<Tensor>;
}

/// Bilinear sampling on an affine grid, zero outside the image.
#[derive(Debug, Clone, Copy, Default)]
pub struct BilinearPatchResampler;

impl PatchResampler for BilinearPatchResampler {
    fn resample(
        &self,
        images: &Tensor,
        centers: &Tensor,
        half_axes: &Tensor,
        angles: &Tensor,
        size: usize,
    ) -> Result<Tensor> {
        let (batch, channels, _, _) = images.dims4()?;
        let (_, points, _) = centers.dims3()?;
        let (xs, ys) = sampling_grid(centers, half_axes, angles, size)?;

        let xs = xs.reshape((batch, points * size * size))?;
        let ys = ys.reshape((batch, points * size * size))?;
        let sampled = bilinear_sample(images, &xs, &ys)?;

        sampled
            .reshape((batch, channels, points, size, size))?
            .permute((0, 2, 3, 4, 1))?
            .contiguous()
    }
}

/// Pixel coordinates of every patch sample: two `[batch, points, size, size]` tensors.
fn sampling_grid(
    centers: &Tensor,
    half_axes: &Tensor,
    angles: &Tensor,
    size: usize,
) -> Result<(Tensor, Tensor)> {
    let device = centers.device();
    let offsets: Vec<f32> = (0..size)
        .map(|i| -1.0 + (2 * i + 1) as f32 / size as f32)
        .collect();
    let u = Tensor::from_slice(&offsets, (1, 1, 1, size), device)?;
    let v = Tensor::from_slice(&offsets, (1, 1, size, 1), device)?;

    let column = |t: &Tensor, i: usize| -> Result<Tensor> {
        t.to_dtype(DType::F32)?.narrow(2, i, 1)?.unsqueeze(3)
    };
    let cx = column(centers, 0)?;
    let cy = column(centers, 1)?;
    let du = u.broadcast_mul(&column(half_axes, 0)?)?;
    let dv = v.broadcast_mul(&column(half_axes, 1)?)?;

    let theta = angles.to_dtype(DType::F32)?.unsqueeze(2)?.unsqueeze(3)?;
    let cos = theta.cos()?;
    let sin = theta.sin()?;

    let xs = cos
        .broadcast_mul(&du)?
        .broadcast_sub(&sin.broadcast_mul(&dv)?)?
        .broadcast_add(&cx)?;
    let ys = sin
        .broadcast_mul(&du)?
        .broadcast_add(&cos.broadcast_mul(&dv)?)?
        .broadcast_add(&cy)?;
    Ok((xs, ys))
}

/// Sample `images` `[b, c, h, w]` at pixel coordinates `xs`, `ys` `[b, q]`.
///
/// Returns `[b, c, q]`. Corners outside the image contribute zero.
pub fn bilinear_sample(images: &Tensor, xs: &Tensor, ys: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = images.dims4()?;
    if h == 0 || w == 0 {
        candle_core::bail!("cannot sample an empty {h}x{w} image");
    }
    let q = xs.dim(1)?;
    let dtype = images.dtype();
    let flat = images.reshape((b, c, h * w))?;

    let x0 = xs.floor()?;
    let y0 = ys.floor()?;
    let x1 = (&x0 + 1.0)?;
    let y1 = (&y0 + 1.0)?;
    let fx = (xs - &x0)?;
    let fy = (ys - &y0)?;
    let gx = fx.affine(-1.0, 1.0)?;
    let gy = fy.affine(-1.0, 1.0)?;

    let corners = [
        (&x0, &y0, gx.mul(&gy)?),
        (&x1, &y0, fx.mul(&gy)?),
        (&x0, &y1, gx.mul(&fy)?),
        (&x1, &y1, fx.mul(&fy)?),
    ];

    let mut out = Tensor::zeros((b, c, q), dtype, images.device())?;
    for (cx, cy, weight) in corners {
        let inside = cx
            .ge(0.0)?
            .mul(&cx.le((w - 1) as f64)?)?
            .mul(&cy.ge(0.0)?.mul(&cy.le((h - 1) as f64)?)?)?
            .to_dtype(DType::F32)?;

        let index = ((cy.clamp(0.0, (h - 1) as f64)? * w as f64)?
            + cx.clamp(0.0, (w - 1) as f64)?)?
            .to_dtype(DType::U32)?
            .unsqueeze(1)?
            .broadcast_as((b, c, q))?
            .contiguous()?;
        let values = flat.gather(&index, 2)?;

        let weight = weight.mul(&inside)?.to_dtype(dtype)?.unsqueeze(1)?;
        out = (out + values.broadcast_mul(&weight)?)?;
    }
    Ok(out)
}
