//! Tensor bundles passed between the pipelines and the encoder.
//!
//! All tensors are `candle_core::Tensor`. Token ids are U32; attention masks
//! may be any numeric dtype (they are converted to the hidden dtype before
//! pooling).

use candle_core::{IndexOp, Tensor};

use crate::error::{ContrastiveError, ContrastiveResult};

/// Token ids plus their co-travelling mask and optional side inputs.
///
/// Shape is `(batch, num_views, seq_len)` for the contrastive path or
/// `(batch, seq_len)` for single-view encoding. `attention_mask` and
/// `token_type_ids` always share the shape of `input_ids`.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Option<Tensor>,
    pub position_ids: Option<Tensor>,
}

impl TokenBatch {
    /// Build a batch, checking that the mask matches the ids.
    pub fn new(input_ids: Tensor, attention_mask: Tensor) -> ContrastiveResult<Self> {
        let batch = Self {
            input_ids,
            attention_mask,
            token_type_ids: None,
            position_ids: None,
        };
        batch.check_shapes()?;
        Ok(batch)
    }

    /// Attach token-type ids (same shape as `input_ids`).
    pub fn with_token_type_ids(mut self, token_type_ids: Tensor) -> ContrastiveResult<Self> {
        self.token_type_ids = Some(token_type_ids);
        self.check_shapes()?;
        Ok(self)
    }

    /// Attach position ids. Passed through to the encoder unchanged.
    pub fn with_position_ids(mut self, position_ids: Tensor) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    /// Mask and token-type shapes must equal the id shape.
    pub fn check_shapes(&self) -> ContrastiveResult<()> {
        let ids = self.input_ids.dims();
        if self.attention_mask.dims() != ids {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!(
                    "attention_mask {:?} does not match input_ids {:?}",
                    self.attention_mask.dims(),
                    ids
                ),
            });
        }
        if let Some(tt) = &self.token_type_ids {
            if tt.dims() != ids {
                return Err(ContrastiveError::ShapeMismatch {
                    context: format!(
                        "token_type_ids {:?} does not match input_ids {:?}",
                        tt.dims(),
                        ids
                    ),
                });
            }
        }
        Ok(())
    }

    /// Batch size (dimension 0).
    pub fn batch_size(&self) -> ContrastiveResult<usize> {
        self.input_ids
            .dim(0)
            .map_err(|e| ContrastiveError::tensor("batch size", e))
    }

    /// Number of views for a 3-D batch.
    pub fn num_views(&self) -> ContrastiveResult<usize> {
        let (_, views, _) = self.dims3()?;
        Ok(views)
    }

    fn dims3(&self) -> ContrastiveResult<(usize, usize, usize)> {
        self.input_ids
            .dims3()
            .map_err(|_| ContrastiveError::ShapeMismatch {
                context: format!(
                    "expected (batch, num_views, seq_len) input_ids, got {:?}",
                    self.input_ids.dims()
                ),
            })
    }

    /// Extract one view as a `(batch, seq_len)` batch.
    pub fn view(&self, index: usize) -> ContrastiveResult<TokenBatch> {
        let (_, views, _) = self.dims3()?;
        if index >= views {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!("view {} requested from a batch with {} views", index, views),
            });
        }
        let pick = |t: &Tensor| -> ContrastiveResult<Tensor> {
            t.i((.., index))
                .and_then(|v| v.contiguous())
                .map_err(|e| ContrastiveError::tensor("select view", e))
        };
        Ok(TokenBatch {
            input_ids: pick(&self.input_ids)?,
            attention_mask: pick(&self.attention_mask)?,
            token_type_ids: self.token_type_ids.as_ref().map(pick).transpose()?,
            position_ids: self.position_ids.clone(),
        })
    }

    /// Keep the first `count` views.
    pub fn take_views(&self, count: usize) -> ContrastiveResult<TokenBatch> {
        let (_, views, _) = self.dims3()?;
        if count == 0 || count > views {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!("cannot keep {} views of a batch with {} views", count, views),
            });
        }
        let keep = |t: &Tensor| -> ContrastiveResult<Tensor> {
            t.narrow(1, 0, count)
                .and_then(|v| v.contiguous())
                .map_err(|e| ContrastiveError::tensor("truncate views", e))
        };
        Ok(TokenBatch {
            input_ids: keep(&self.input_ids)?,
            attention_mask: keep(&self.attention_mask)?,
            token_type_ids: self.token_type_ids.as_ref().map(keep).transpose()?,
            position_ids: self.position_ids.clone(),
        })
    }

    /// Flatten `(batch, num_views, seq_len)` to `(batch * num_views, seq_len)`.
    pub fn flatten_views(&self) -> ContrastiveResult<TokenBatch> {
        let (batch, views, seq_len) = self.dims3()?;
        let flat = |t: &Tensor| -> ContrastiveResult<Tensor> {
            t.reshape((batch * views, seq_len))
                .map_err(|e| ContrastiveError::tensor("flatten views", e))
        };
        Ok(TokenBatch {
            input_ids: flat(&self.input_ids)?,
            attention_mask: flat(&self.attention_mask)?,
            token_type_ids: self.token_type_ids.as_ref().map(flat).transpose()?,
            position_ids: self.position_ids.clone(),
        })
    }

    /// Borrow as encoder input.
    pub fn as_encoder_input(&self, output_hidden_states: bool) -> EncoderInput<'_> {
        EncoderInput {
            input_ids: &self.input_ids,
            attention_mask: &self.attention_mask,
            token_type_ids: self.token_type_ids.as_ref(),
            position_ids: self.position_ids.as_ref(),
            output_hidden_states,
            output_attentions: false,
        }
    }
}

/// Arguments of one encoder call over a `(batch, seq_len)` token matrix.
#[derive(Debug, Clone, Copy)]
pub struct EncoderInput<'a> {
    pub input_ids: &'a Tensor,
    pub attention_mask: &'a Tensor,
    pub token_type_ids: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
    /// Return every layer output in `EncoderOutput::hidden_states`.
    pub output_hidden_states: bool,
    /// Return attention maps in `EncoderOutput::attentions`.
    pub output_attentions: bool,
}

/// What an encoder returns for one call.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `(batch, seq_len, hidden)` final layer states.
    pub last_hidden_state: Tensor,
    /// Encoder-native pooled output, if the encoder has one.
    pub pooler_output: Option<Tensor>,
    /// Per-layer states; index 0 is the embedding layer, last is the final layer.
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

/// Axis along which the cutoff augmentation zeroes entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffDirection {
    /// Zero whole token positions.
    Row,
    /// Zero whole hidden dimensions.
    Column,
}

/// Cutoff augmentation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cutoff {
    pub direction: CutoffDirection,
    /// Fraction of rows/columns zeroed, in `[0, 1)`.
    pub rate: f32,
}

/// Data augmentation applied inside an encoder call.
///
/// Passed explicitly with the call it affects; encoders hold no augmentation
/// state between calls.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Augmentation {
    /// Permute the token positions before encoding.
    pub shuffle: bool,
    pub cutoff: Option<Cutoff>,
}

impl Augmentation {
    /// Shuffle plus column cutoff, the setting used for the strongly augmented view.
    pub fn stronger(cutoff_rate: f32) -> Self {
        Self {
            shuffle: true,
            cutoff: Some(Cutoff {
                direction: CutoffDirection::Column,
                rate: cutoff_rate,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn three_view_batch() -> TokenBatch {
        let device = Device::Cpu;
        let ids: Vec<u32> = (0..2 * 3 * 4).collect();
        let input_ids = Tensor::from_vec(ids, (2, 3, 4), &device).unwrap();
        let mask = Tensor::ones((2, 3, 4), DType::U32, &device).unwrap();
        TokenBatch::new(input_ids, mask).unwrap()
    }

    #[test]
    fn test_mask_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let ids = Tensor::zeros((2, 2, 4), DType::U32, &device).unwrap();
        let mask = Tensor::ones((2, 2, 5), DType::U32, &device).unwrap();
        let err = TokenBatch::new(ids, mask).unwrap_err();
        assert!(matches!(err, ContrastiveError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_view_extracts_second_axis() {
        let batch = three_view_batch();
        let v2 = batch.view(2).unwrap();
        assert_eq!(v2.input_ids.dims(), &[2, 4]);
        let rows: Vec<Vec<u32>> = v2.input_ids.to_vec2().unwrap();
        assert_eq!(rows[0], vec![8, 9, 10, 11]);
        assert_eq!(rows[1], vec![20, 21, 22, 23]);
        assert!(batch.view(3).is_err());
    }

    #[test]
    fn test_take_views_keeps_leading_views() {
        let batch = three_view_batch();
        let two = batch.take_views(2).unwrap();
        assert_eq!(two.input_ids.dims(), &[2, 2, 4]);
        assert_eq!(two.num_views().unwrap(), 2);
        assert!(batch.take_views(4).is_err());
    }

    #[test]
    fn test_flatten_views_orders_by_example_then_view() {
        let batch = three_view_batch();
        let flat = batch.flatten_views().unwrap();
        assert_eq!(flat.input_ids.dims(), &[6, 4]);
        let rows: Vec<Vec<u32>> = flat.input_ids.to_vec2().unwrap();
        assert_eq!(rows[1], vec![4, 5, 6, 7]);
        assert_eq!(rows[3], vec![12, 13, 14, 15]);
    }

    #[test]
    fn test_stronger_augmentation() {
        let aug = Augmentation::stronger(0.1);
        assert!(aug.shuffle);
        assert_eq!(aug.cutoff.unwrap().direction, CutoffDirection::Column);
        assert_eq!(aug.cutoff.unwrap().rate, 0.1);
        assert_eq!(Augmentation::default().cutoff, None);
    }
}
