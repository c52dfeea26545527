use thiserror::Error;

#[derive(Error, Debug)]
pub enum ViTError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("channel mismatch: expected {expected} image channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("batch mismatch: {images} images but {keypoints} keypoint sets")]
    BatchMismatch { images: usize, keypoints: usize },

    #[error("invalid shape for {name}: expected {expected}, got {got:?}")]
    InvalidShape {
        name: &'static str,
        expected: &'static str,
        got: Vec<usize>,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ViTError>;
