//! Results of the two forward pipelines.
//!
//! Each pipeline returns either a positional tuple or a named structure,
//! selected per call by `return_dict`.

use candle_core::Tensor;

/// Named result of the contrastive pipeline.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput {
    /// Scalar training loss (contrastive, plus the weighted bank term when enabled).
    pub loss: Tensor,
    /// `(N, N)` temperature-scaled similarity of anchors against positives.
    pub logits: Tensor,
    /// `0..N` as U32.
    pub labels: Tensor,
    /// Scalar cross-entropy term alone.
    pub contrastive_loss: Tensor,
    /// Scalar bank distillation term before weighting.
    pub bank_loss: Option<Tensor>,
    /// Pooled auxiliary view (MLM reconstruction or strongly augmented view).
    pub augmented: Option<Tensor>,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

/// Named result of the sentence-embedding pipeline.
#[derive(Debug, Clone)]
pub struct SentenceEmbeddingOutput {
    /// `(batch, hidden)` sentence vectors.
    pub pooler_output: Tensor,
    pub last_hidden_state: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

/// Output of either pipeline.
///
/// Tuple layouts:
/// - contrastive: `(loss, logits, ...hidden_states, ...attentions)`
/// - sentence embedding: `(last_hidden_state, pooler_output, ...hidden_states, ...attentions)`
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Tuple(Vec<Tensor>),
    Contrastive(ContrastiveOutput),
    SentenceEmbedding(SentenceEmbeddingOutput),
}

impl ModelOutput {
    /// Training loss of a named contrastive output.
    ///
    /// Only reads named outputs: a `Tuple` returns `None` even when it came
    /// from the contrastive pipeline, where the loss sits at index 0.
    pub fn loss(&self) -> Option<&Tensor> {
        match self {
            ModelOutput::Contrastive(out) => Some(&out.loss),
            ModelOutput::SentenceEmbedding(_) => None,
            ModelOutput::Tuple(_) => None,
        }
    }

    pub fn into_contrastive(self) -> Option<ContrastiveOutput> {
        match self {
            ModelOutput::Contrastive(out) => Some(out),
            _ => None,
        }
    }

    pub fn into_sentence_embedding(self) -> Option<SentenceEmbeddingOutput> {
        match self {
            ModelOutput::SentenceEmbedding(out) => Some(out),
            _ => None,
        }
    }

    pub fn into_tuple(self) -> Option<Vec<Tensor>> {
        match self {
            ModelOutput::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl ContrastiveOutput {
    pub(crate) fn into_tuple(self) -> Vec<Tensor> {
        let mut items = vec![self.loss, self.logits];
        items.extend(self.hidden_states.unwrap_or_default());
        items.extend(self.attentions.unwrap_or_default());
        items
    }
}

impl SentenceEmbeddingOutput {
    pub(crate) fn into_tuple(self) -> Vec<Tensor> {
        let mut items = vec![self.last_hidden_state, self.pooler_output];
        items.extend(self.hidden_states.unwrap_or_default());
        items.extend(self.attentions.unwrap_or_default());
        items
    }
}
