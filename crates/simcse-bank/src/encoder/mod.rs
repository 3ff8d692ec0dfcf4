//! Capabilities the forward pipelines consume from their collaborators.
//!
//! The contrastive core never inspects encoder internals. It needs:
//! - an [`Encoder`] mapping token ids to per-token hidden states (and, on
//!   request, the per-layer stack), honouring explicit [`Augmentation`]s
//! - a [`MaskedTokenPredictor`] mapping token ids to vocabulary logits,
//!   consumed only through its arg-max
//!
//! [`LookupEncoder`] and [`TiedTokenPredictor`] are small self-contained
//! implementations built from a `VarBuilder`.
//!
//! [`Augmentation`]: crate::types::Augmentation

mod lookup;

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::ContrastiveResult;
use crate::types::{Augmentation, EncoderInput, EncoderOutput};

pub use lookup::{LookupEncoder, LookupEncoderConfig, TiedTokenPredictor};

/// Text encoder: `(batch, seq_len)` token ids → `(batch, seq_len, hidden)` states.
pub trait Encoder {
    /// Width of every hidden state.
    fn hidden_size(&self) -> usize;

    /// Encode one token matrix.
    ///
    /// `augmentation` alters only this call. Implementations return
    /// `hidden_states` when `input.output_hidden_states` is set.
    fn encode(
        &self,
        input: &EncoderInput<'_>,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<EncoderOutput>;
}

/// Masked-token predictor used to reconstruct the MLM view.
pub trait MaskedTokenPredictor {
    fn vocab_size(&self) -> usize;

    /// `(batch, seq_len)` ids → `(batch, seq_len, vocab)` logits.
    fn predict_logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> ContrastiveResult<Tensor>;
}

impl<E: Encoder + ?Sized> Encoder for &E {
    fn hidden_size(&self) -> usize {
        (**self).hidden_size()
    }

    fn encode(
        &self,
        input: &EncoderInput<'_>,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<EncoderOutput> {
        (**self).encode(input, augmentation)
    }
}

impl<E: Encoder + ?Sized> Encoder for Arc<E> {
    fn hidden_size(&self) -> usize {
        (**self).hidden_size()
    }

    fn encode(
        &self,
        input: &EncoderInput<'_>,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<EncoderOutput> {
        (**self).encode(input, augmentation)
    }
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn hidden_size(&self) -> usize {
        (**self).hidden_size()
    }

    fn encode(
        &self,
        input: &EncoderInput<'_>,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<EncoderOutput> {
        (**self).encode(input, augmentation)
    }
}
