use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

/// Two-layer feed-forward block: Linear → GELU → Linear → Dropout.
///
/// Weight names follow a sequential container: the linears sit at `0` and
/// `2`, with GELU at `1` and dropout at `3`.
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(embed_dim: usize, hidden_dim: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(embed_dim, hidden_dim, vb.pp("0"))?;
        let fc2 = linear(hidden_dim, embed_dim, vb.pp("2"))?;
        Ok(Self {
            fc1,
            fc2,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?.gelu_erf()?;
        let out = self.fc2.forward(&hidden)?;
        self.dropout.forward(&out, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    #[test]
    fn keeps_embedding_width() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mlp = FeedForward::new(32, 128, 0.1, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 7, 32), &device).unwrap();
        assert_eq!(mlp.forward_t(&xs, false).unwrap().dims(), &[2, 7, 32]);
    }

    #[test]
    fn dropout_only_in_training() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mlp = FeedForward::new(16, 64, 0.5, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (4, 16, 16), &device).unwrap();

        let eval_a: Vec<f32> = mlp.forward_t(&xs, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let eval_b: Vec<f32> = mlp.forward_t(&xs, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(eval_a, eval_b);

        let train: Vec<f32> = mlp.forward_t(&xs, true).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let zeroed = train.iter().filter(|&&v| v == 0.0).count();
        assert!(zeroed > 0, "training pass dropped nothing");
    }

    #[test]
    fn weight_names_follow_sequential_layout() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        FeedForward::new(8, 16, 0.0, vb.pp("mlp")).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in ["mlp.0.weight", "mlp.0.bias", "mlp.2.weight", "mlp.2.bias"] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("mlp.3.weight"));
    }

    #[test]
    fn loads_sequential_checkpoint_tensors() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("mlp.0.weight".to_string(), Tensor::ones((16, 8), DType::F32, &device).unwrap());
        tensors.insert("mlp.0.bias".to_string(), Tensor::zeros(16, DType::F32, &device).unwrap());
        tensors.insert("mlp.2.weight".to_string(), Tensor::ones((8, 16), DType::F32, &device).unwrap());
        tensors.insert("mlp.2.bias".to_string(), Tensor::ones(8, DType::F32, &device).unwrap());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

        let mlp = FeedForward::new(8, 16, 0.0, vb.pp("mlp")).unwrap();
        let xs = Tensor::zeros((1, 2, 8), DType::F32, &device).unwrap();
        // Zero input: fc1 gives 0, gelu(0) = 0, fc2 leaves only its bias.
        let out: Vec<f32> = mlp.forward_t(&xs, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|&v| v == 1.0));
    }
}
