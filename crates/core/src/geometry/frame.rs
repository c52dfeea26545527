//! Local affine frames and their decomposition into keypoint geometry.
//!
//! A frame maps the unit disc onto an image ellipse: `p = A·u + c`, with `A`
//! the 2×2 linear part and `c` the center in pixel coordinates. The ellipse
//! axes are the singular values of `A`, obtained from the closed-form
//! eigendecomposition of the symmetric matrix `A·Aᵀ`:
//!
//! ```text
//! A·Aᵀ = [[p, q], [q, r]]
//! λ₁,₂ = (p + r)/2 ± sqrt(((p − r)/2)² + q²)
//! θ    = ½·atan2(2q, p − r)          // major axis, in (−π/2, π/2]
//! ```

use candle_core::{Result, Tensor};

/// One detected keypoint as a local affine frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineFrame {
    /// Center `(x, y)` in pixels.
    pub center: [f32; 2],
    /// Row-major 2×2 linear part.
    pub linear: [[f32; 2]; 2],
}

/// Decomposed frame: `[x, y, scale_a, scale_b, angle]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeypointGeometry {
    pub x: f32,
    pub y: f32,
    /// Major axis length, `scale_a >= scale_b >= 0`.
    pub scale_a: f32,
    pub scale_b: f32,
    /// Major axis orientation in radians, `(−π/2, π/2]`.
    pub angle: f32,
}

/// Number of components in a geometry vector.
pub const GEOMETRY_DIM: usize = 5;

impl AffineFrame {
    pub fn new(center: [f32; 2], linear: [[f32; 2]; 2]) -> Self {
        Self { center, linear }
    }

    /// Build a frame from the `[[a11, a12, x], [a21, a22, y]]` layout.
    pub fn from_rows(rows: [[f32; 3]; 2]) -> Self {
        Self {
            center: [rows[0][2], rows[1][2]],
            linear: [[rows[0][0], rows[0][1]], [rows[1][0], rows[1][1]]],
        }
    }

    /// Isotropic frame: a circle of radius `scale` rotated by `angle`.
    pub fn isotropic(center: [f32; 2], scale: f32, angle: f32) -> Self {
        Self::oriented(center, scale, scale, angle)
    }

    /// Frame whose ellipse has axes `scale_a` (along `angle`) and `scale_b`.
    pub fn oriented(center: [f32; 2], scale_a: f32, scale_b: f32, angle: f32) -> Self {
        let (s, c) = angle.sin_cos();
        Self {
            center,
            linear: [[c * scale_a, -s * scale_b], [s * scale_a, c * scale_b]],
        }
    }

    pub fn to_rows(&self) -> [[f32; 3]; 2] {
        [
            [self.linear[0][0], self.linear[0][1], self.center[0]],
            [self.linear[1][0], self.linear[1][1], self.center[1]],
        ]
    }

    /// Split the frame into center, axis lengths and orientation.
    ///
    /// Degenerate (rank-deficient or zero) linear parts yield zero axes and
    /// never fail.
    pub fn decompose(&self) -> KeypointGeometry {
        let [[a11, a12], [a21, a22]] = self.linear;
        let p = a11 * a11 + a12 * a12;
        let q = a11 * a21 + a12 * a22;
        let r = a21 * a21 + a22 * a22;

        let half_trace = 0.5 * (p + r);
        let half_diff = 0.5 * (p - r);
        let radius = (half_diff * half_diff + q * q).sqrt();
        let major = (half_trace + radius).max(0.0);
        let minor = (half_trace - radius).max(0.0);

        let mut angle = 0.5 * (2.0 * q).atan2(p - r);
        if angle <= -std::f32::consts::FRAC_PI_2 {
            angle += std::f32::consts::PI;
        }

        KeypointGeometry {
            x: self.center[0],
            y: self.center[1],
            scale_a: major.sqrt(),
            scale_b: minor.sqrt(),
            angle,
        }
    }
}

impl KeypointGeometry {
    pub fn to_array(&self) -> [f32; GEOMETRY_DIM] {
        [self.x, self.y, self.scale_a, self.scale_b, self.angle]
    }

    pub fn from_array(v: [f32; GEOMETRY_DIM]) -> Self {
        Self {
            x: v[0],
            y: v[1],
            scale_a: v[2],
            scale_b: v[3],
            angle: v[4],
        }
    }
}

/// Decompose a batch of frames in one pass.
pub fn decompose_frames(frames: &[AffineFrame]) -> Vec<KeypointGeometry> {
    frames.iter().map(AffineFrame::decompose).collect()
}

/// Read a `(B, P, 2, 3)` frame tensor into per-image frame lists.
///
/// `counts[b]` limits how many leading frames of image `b` are kept; without
/// counts every row is treated as a detection.
pub fn frames_from_tensor(lafs: &Tensor, counts: Option<&[usize]>) -> Result<Vec<Vec<AffineFrame>>> {
    let (b, p, rows, cols) = lafs.dims4()?;
    if rows != 2 || cols != 3 {
        candle_core::bail!("affine frames must be (batch, points, 2, 3), got {:?}", lafs.dims());
    }
    if let Some(counts) = counts {
        if counts.len() != b {
            candle_core::bail!("{} keypoint counts for a batch of {b}", counts.len());
        }
    }
    let flat = lafs
        .to_dtype(candle_core::DType::F32)?
        .reshape((b, p * 6))?
        .to_vec2::<f32>()?;

    let frames = flat
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let n = counts.map_or(p, |c| c[i].min(p));
            row.chunks_exact(6)
                .take(n)
                .map(|v| AffineFrame::from_rows([[v[0], v[1], v[2]], [v[3], v[4], v[5]]]))
                .collect()
        })
        .collect();
    Ok(frames)
}
