use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ViTError};

/// How the relative geometry bias takes part in attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeBiasMode {
    /// Bias tensor is computed every forward pass but never reaches the
    /// attention scores.
    #[default]
    ComputeOnly,
    /// Bias is reduced per head and added to the scaled scores before softmax.
    Inject,
}

/// Keypoint detector implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Isotropic frames on a regular lattice.
    Grid,
    /// Harris corners with structure-tensor affine shape.
    #[default]
    Harris,
}

/// Compute device for parameters and activations (`cpu`, `cuda:N`, `metal:N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Instantiate the candle device. Fails when the backend is not compiled in.
    pub fn to_device(self) -> Result<Device> {
        let device = match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceSpec {
    type Err = ViTError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    ViTError::InvalidConfig(format!("invalid device ordinal in '{s}'"))
                })?;
                (kind.to_string(), ordinal)
            }
            None => (lower.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(ViTError::InvalidConfig(format!(
                "unknown device '{s}'. Supported: cpu, cuda[:N], metal[:N]"
            ))),
        }
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = ViTError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DeviceSpec> for String {
    fn from(spec: DeviceSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

fn default_in_channels() -> usize {
    3
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_dropout() -> f32 {
    0.1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointViTConfig {
    pub img_size: usize,
    pub patch_size: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub num_classes: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub max_point_num: usize,
    pub mlp_ratio: f64,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_dropout")]
    pub attn_dropout: f32,
    #[serde(default = "default_dropout")]
    pub mlp_dropout: f32,
    #[serde(default = "default_dropout")]
    pub token_dropout: f32,

    #[serde(default)]
    pub relative_bias: RelativeBiasMode,
    /// Exclude padded keypoint tokens as attention keys.
    #[serde(default)]
    pub mask_padding: bool,
    #[serde(default)]
    pub feature_extractor: DetectorKind,
    #[serde(default)]
    pub device: DeviceSpec,
}

impl Default for KeypointViTConfig {
    fn default() -> Self {
        Self {
            img_size: 224,
            patch_size: 16,
            in_channels: 3,
            num_classes: 10,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            max_point_num: 128,
            mlp_ratio: 4.0,
            layer_norm_eps: 1e-5,
            attn_dropout: 0.1,
            mlp_dropout: 0.1,
            token_dropout: 0.1,
            relative_bias: RelativeBiasMode::ComputeOnly,
            mask_padding: false,
            feature_extractor: DetectorKind::Harris,
            device: DeviceSpec::Cpu,
        }
    }
}

impl KeypointViTConfig {
    /// Per-head slice of the embedding.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Width of the feed-forward hidden layer.
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Token sequence length: class token plus the keypoint capacity.
    pub fn seq_len(&self) -> usize {
        self.max_point_num + 1
    }

    /// Check the construction-time invariants. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("img_size", self.img_size),
            ("patch_size", self.patch_size),
            ("in_channels", self.in_channels),
            ("num_classes", self.num_classes),
            ("embed_dim", self.embed_dim),
            ("depth", self.depth),
            ("num_heads", self.num_heads),
            ("max_point_num", self.max_point_num),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ViTError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(ViTError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim, self.num_heads
            )));
        }
        if !(self.mlp_ratio > 0.0) || self.mlp_hidden_dim() == 0 {
            return Err(ViTError::InvalidConfig(format!(
                "mlp_ratio must give a non-empty hidden layer, got {}",
                self.mlp_ratio
            )));
        }
        let dropouts = [
            ("attn_dropout", self.attn_dropout),
            ("mlp_dropout", self.mlp_dropout),
            ("token_dropout", self.token_dropout),
        ];
        for (name, p) in dropouts {
            if !(0.0..1.0).contains(&p) {
                return Err(ViTError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(())
    }
}
