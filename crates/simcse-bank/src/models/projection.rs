//! Projection head applied over `cls` representations.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use crate::error::{ContrastiveError, ContrastiveResult};

/// `tanh(W x + b)` with `W` of shape `[hidden, hidden]`.
///
/// Weights live under the `dense` prefix of the supplied `VarBuilder`, so a
/// `VarMap`-backed builder makes them trainable.
#[derive(Debug, Clone)]
pub struct ProjectionHead {
    dense: Linear,
}

impl ProjectionHead {
    pub fn new(hidden_size: usize, vb: VarBuilder) -> ContrastiveResult<Self> {
        let dense = candle_nn::linear(hidden_size, hidden_size, vb.pp("dense"))
            .map_err(|e| ContrastiveError::tensor("projection head init", e))?;
        Ok(Self { dense })
    }

    /// Works on `(batch, hidden)` and `(batch, views, hidden)` inputs.
    pub fn forward(&self, features: &Tensor) -> ContrastiveResult<Tensor> {
        self.dense
            .forward(features)
            .and_then(|x| x.tanh())
            .map_err(|e| ContrastiveError::tensor("projection head forward", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    #[test]
    fn test_shape_preserved_for_two_and_three_dims() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ProjectionHead::new(8, vb).unwrap();

        let x2 = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(head.forward(&x2).unwrap().dims(), &[4, 8]);

        let x3 = Tensor::ones((4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(head.forward(&x3).unwrap().dims(), &[4, 2, 8]);

        // dense weight + bias registered for training
        assert_eq!(varmap.all_vars().len(), 2);
    }

    #[test]
    fn test_output_bounded_by_tanh() {
        let weight = Tensor::eye(3, DType::F32, &Device::Cpu).unwrap().affine(100.0, 0.0).unwrap();
        let bias = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let tensors: HashMap<String, Tensor> = [
            ("dense.weight".to_string(), weight),
            ("dense.bias".to_string(), bias),
        ]
        .into_iter()
        .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        let head = ProjectionHead::new(3, vb).unwrap();
        let x = Tensor::new(&[[1.0f32, -1.0, 0.0]], &Device::Cpu).unwrap();
        let y: Vec<f32> = head.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((y[0] - 1.0).abs() < 1e-6);
        assert!((y[1] + 1.0).abs() < 1e-6);
        assert_eq!(y[2], 0.0);
    }
}
