pub mod attention;
pub mod encoder;
pub mod mask;
pub mod mlp;
pub mod patch_embed;
pub mod relative_bias;

pub use attention::MultiHeadSelfAttention;
pub use encoder::{EncoderLayer, EncoderStack};
pub use mask::key_padding_mask;
pub use mlp::FeedForward;
pub use patch_embed::PatchEmbedder;
pub use relative_bias::RelativeGeometryBias;
