//! Parameter-free poolers producing one sentence vector per sequence.
//!
//! - `cls` / `cls_before_pooler`: first-position state of the last layer
//! - `avg`: masked mean of the last layer
//! - `avg_first_last`: masked mean of `(first encoder layer + last layer) / 2`
//! - `avg_top2`: masked mean of `(last layer + second-to-last layer) / 2`
//!
//! The masked mean divides by the number of real tokens without an epsilon;
//! every sequence must carry at least one unmasked token.

use candle_core::{IndexOp, Tensor};

use crate::config::PoolerType;
use crate::error::{ContrastiveError, ContrastiveResult};
use crate::types::EncoderOutput;

/// Reduces `(batch, seq_len, hidden)` encoder states to `(batch, hidden)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pooler {
    pooler_type: PoolerType,
}

impl Pooler {
    pub fn new(pooler_type: PoolerType) -> Self {
        Self { pooler_type }
    }

    pub fn pooler_type(&self) -> PoolerType {
        self.pooler_type
    }

    /// Pool one encoder output.
    ///
    /// # Arguments
    /// * `attention_mask` - `(batch, seq_len)`, 1 for real tokens, 0 for padding
    /// * `outputs` - encoder output; multi-layer modes need `hidden_states`
    ///
    /// # Errors
    /// - `MissingHiddenStates` when a multi-layer mode gets fewer than two layers
    /// - `ShapeMismatch` when the mask does not cover the hidden states
    pub fn forward(&self, attention_mask: &Tensor, outputs: &EncoderOutput) -> ContrastiveResult<Tensor> {
        match self.pooler_type {
            PoolerType::Cls | PoolerType::ClsBeforePooler => outputs
                .last_hidden_state
                .i((.., 0))
                .and_then(|t| t.contiguous())
                .map_err(|e| ContrastiveError::tensor("cls pooling", e)),
            PoolerType::Avg => masked_mean(&outputs.last_hidden_state, attention_mask),
            PoolerType::AvgFirstLast => {
                let layers = self.layers(outputs)?;
                let first = &layers[1];
                let last = &layers[layers.len() - 1];
                masked_mean(&average_pair(first, last)?, attention_mask)
            }
            PoolerType::AvgTop2 => {
                let layers = self.layers(outputs)?;
                let last = &layers[layers.len() - 1];
                let second_last = &layers[layers.len() - 2];
                masked_mean(&average_pair(last, second_last)?, attention_mask)
            }
        }
    }

    fn layers<'a>(&self, outputs: &'a EncoderOutput) -> ContrastiveResult<&'a [Tensor]> {
        let layers = outputs.hidden_states.as_deref().unwrap_or(&[]);
        if layers.len() < 2 {
            return Err(ContrastiveError::MissingHiddenStates {
                pooler_type: self.pooler_type.to_string(),
                required: 2,
                available: layers.len(),
            });
        }
        Ok(layers)
    }
}

fn average_pair(a: &Tensor, b: &Tensor) -> ContrastiveResult<Tensor> {
    (a + b)
        .and_then(|sum| sum.affine(0.5, 0.0))
        .map_err(|e| ContrastiveError::tensor("layer average", e))
}

/// `sum(hidden * mask) / sum(mask)` over the sequence axis.
pub fn masked_mean(hidden: &Tensor, attention_mask: &Tensor) -> ContrastiveResult<Tensor> {
    let (batch, seq_len, _) = hidden.dims3().map_err(|_| ContrastiveError::ShapeMismatch {
        context: format!("expected (batch, seq_len, hidden) states, got {:?}", hidden.dims()),
    })?;
    if attention_mask.dims() != [batch, seq_len] {
        return Err(ContrastiveError::ShapeMismatch {
            context: format!(
                "attention_mask {:?} does not cover hidden states {:?}",
                attention_mask.dims(),
                hidden.dims()
            ),
        });
    }

    let mask = attention_mask
        .to_dtype(hidden.dtype())
        .map_err(|e| ContrastiveError::tensor("mask dtype", e))?;

    let summed = mask
        .unsqueeze(2)
        .and_then(|m| hidden.broadcast_mul(&m))
        .and_then(|masked| masked.sum(1))
        .map_err(|e| ContrastiveError::tensor("masked sum", e))?;

    let counts = mask
        .sum_keepdim(1)
        .map_err(|e| ContrastiveError::tensor("mask sum", e))?;

    summed
        .broadcast_div(&counts)
        .map_err(|e| ContrastiveError::tensor("mean pooling div", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn states(batch: usize, seq: usize, hidden: usize, offset: f32) -> Tensor {
        let data: Vec<f32> = (0..batch * seq * hidden)
            .map(|i| (i as f32 * 0.37 + offset).sin())
            .collect();
        Tensor::from_vec(data, (batch, seq, hidden), &Device::Cpu).unwrap()
    }

    fn output_with_layers(layers: Vec<Tensor>) -> EncoderOutput {
        EncoderOutput {
            last_hidden_state: layers[layers.len() - 1].clone(),
            pooler_output: None,
            hidden_states: Some(layers),
            attentions: None,
        }
    }

    #[test]
    fn test_every_mode_yields_batch_by_hidden() {
        for seq in [1usize, 5, 9] {
            let layers = vec![states(3, seq, 4, 0.0), states(3, seq, 4, 1.0), states(3, seq, 4, 2.0)];
            let outputs = output_with_layers(layers);
            let mask = Tensor::ones((3, seq), DType::U32, &Device::Cpu).unwrap();
            for pooler_type in PoolerType::all() {
                let pooled = Pooler::new(*pooler_type).forward(&mask, &outputs).unwrap();
                assert_eq!(pooled.dims(), &[3, 4], "{} seq_len {}", pooler_type, seq);
            }
        }
    }

    #[test]
    fn test_avg_with_full_mask_is_plain_mean() {
        let hidden = states(2, 4, 3, 0.5);
        let outputs = output_with_layers(vec![hidden.clone()]);
        let mask = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let pooled = Pooler::new(PoolerType::Avg).forward(&mask, &outputs).unwrap();
        let expected = hidden.mean(1).unwrap();

        let a: Vec<Vec<f32>> = pooled.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = expected.to_vec2().unwrap();
        for (ra, rb) in a.iter().zip(b.iter()) {
            for (x, y) in ra.iter().zip(rb.iter()) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_avg_single_token_mask_selects_that_position() {
        let hidden = states(1, 5, 4, 0.0);
        let outputs = output_with_layers(vec![hidden.clone()]);
        let mask = Tensor::from_vec(vec![0u32, 0, 1, 0, 0], (1, 5), &Device::Cpu).unwrap();
        let pooled = Pooler::new(PoolerType::Avg).forward(&mask, &outputs).unwrap();

        let got: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = hidden.i((0, 2)).unwrap().to_vec1().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn test_cls_takes_first_position() {
        let hidden = states(2, 3, 4, 0.0);
        let outputs = output_with_layers(vec![hidden.clone()]);
        let mask = Tensor::ones((2, 3), DType::U32, &Device::Cpu).unwrap();
        let pooled = Pooler::new(PoolerType::ClsBeforePooler).forward(&mask, &outputs).unwrap();
        let got: Vec<Vec<f32>> = pooled.to_vec2().unwrap();
        let want: Vec<Vec<f32>> = hidden.i((.., 0)).unwrap().to_vec2().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn test_avg_first_last_uses_layer_one_and_last() {
        let emb = states(1, 2, 2, 9.0);
        let first = Tensor::from_vec(vec![1.0f32, 1.0, 3.0, 3.0], (1, 2, 2), &Device::Cpu).unwrap();
        let middle = states(1, 2, 2, 4.0);
        let last = Tensor::from_vec(vec![3.0f32, 5.0, 5.0, 7.0], (1, 2, 2), &Device::Cpu).unwrap();
        let outputs = output_with_layers(vec![emb, first, middle, last]);
        let mask = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let pooled = Pooler::new(PoolerType::AvgFirstLast).forward(&mask, &outputs).unwrap();
        // (first + last) / 2 = [[2,3],[4,5]], mean over tokens = [3,4]
        let got: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![3.0, 4.0]);
    }

    #[test]
    fn test_avg_top2_uses_last_two_layers() {
        let emb = states(1, 1, 2, 9.0);
        let second_last = Tensor::from_vec(vec![2.0f32, 4.0], (1, 1, 2), &Device::Cpu).unwrap();
        let last = Tensor::from_vec(vec![4.0f32, 8.0], (1, 1, 2), &Device::Cpu).unwrap();
        let outputs = output_with_layers(vec![emb, second_last, last]);
        let mask = Tensor::ones((1, 1), DType::F32, &Device::Cpu).unwrap();
        let pooled = Pooler::new(PoolerType::AvgTop2).forward(&mask, &outputs).unwrap();
        let got: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![3.0, 6.0]);
    }

    #[test]
    fn test_multi_layer_mode_without_stack_fails() {
        let outputs = EncoderOutput {
            last_hidden_state: states(1, 2, 2, 0.0),
            pooler_output: None,
            hidden_states: None,
            attentions: None,
        };
        let mask = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let err = Pooler::new(PoolerType::AvgTop2).forward(&mask, &outputs).unwrap_err();
        assert!(matches!(err, ContrastiveError::MissingHiddenStates { available: 0, .. }));
    }

    #[test]
    fn test_mask_shape_mismatch_is_error() {
        let outputs = output_with_layers(vec![states(2, 3, 4, 0.0)]);
        let mask = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let err = Pooler::new(PoolerType::Avg).forward(&mask, &outputs).unwrap_err();
        assert!(matches!(err, ContrastiveError::ShapeMismatch { .. }));
    }
}
