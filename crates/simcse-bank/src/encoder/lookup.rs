//! Lookup-table encoder with residual dense+tanh layers.
//!
//! # Architecture
//!
//! ```text
//! ids ──> word emb ─┐
//! pos ──> pos emb  ─┼─(+)─> [cutoff] ─> layer 1 ─> ... ─> layer N
//! tt  ──> type emb ─┘        layer k: h + tanh(W_k h + b_k)
//! ```
//!
//! Shuffle permutes the position ids of every non-CLS position, so token
//! content stays aligned with the attention mask. Cutoff zeroes a `rate`
//! fraction of hidden columns (or token rows) of the embedding output.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{Encoder, MaskedTokenPredictor};
use crate::error::{ContrastiveError, ContrastiveResult};
use crate::types::{Augmentation, Cutoff, CutoffDirection, EncoderInput, EncoderOutput};

/// Geometry of a [`LookupEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct LookupEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub max_position_embeddings: usize,
    /// 0 disables token-type embeddings.
    pub type_vocab_size: usize,
    /// Seed for augmentation sampling.
    pub seed: u64,
}

impl Default for LookupEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 1000,
            hidden_size: 64,
            num_layers: 2,
            max_position_embeddings: 128,
            type_vocab_size: 2,
            seed: 42,
        }
    }
}

/// Small trainable encoder satisfying the [`Encoder`] contract.
#[derive(Debug, Clone)]
pub struct LookupEncoder {
    config: LookupEncoderConfig,
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Option<Embedding>,
    layers: Vec<Linear>,
    rng: Arc<Mutex<StdRng>>,
}

impl LookupEncoder {
    /// Create the encoder, registering its weights in `vb`.
    pub fn new(config: LookupEncoderConfig, vb: VarBuilder) -> ContrastiveResult<Self> {
        if config.vocab_size == 0 || config.hidden_size == 0 || config.max_position_embeddings == 0 {
            return Err(ContrastiveError::ConfigError {
                message: format!(
                    "LookupEncoder sizes must be > 0 (vocab {}, hidden {}, positions {})",
                    config.vocab_size, config.hidden_size, config.max_position_embeddings
                ),
            });
        }

        let word_embeddings =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("word_embeddings"))
                .map_err(map_candle)?;
        let position_embeddings = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("position_embeddings"),
        )
        .map_err(map_candle)?;
        let token_type_embeddings = if config.type_vocab_size > 0 {
            Some(
                candle_nn::embedding(
                    config.type_vocab_size,
                    config.hidden_size,
                    vb.pp("token_type_embeddings"),
                )
                .map_err(map_candle)?,
            )
        } else {
            None
        };

        let layers = (0..config.num_layers)
            .map(|i| {
                candle_nn::linear(config.hidden_size, config.hidden_size, vb.pp(format!("layer.{}", i)))
                    .map_err(map_candle)
            })
            .collect::<ContrastiveResult<Vec<_>>>()?;

        tracing::debug!(
            vocab_size = config.vocab_size,
            hidden_size = config.hidden_size,
            num_layers = config.num_layers,
            "LookupEncoder created"
        );

        Ok(Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(config.seed))),
            config,
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            layers,
        })
    }

    pub fn config(&self) -> &LookupEncoderConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.word_embeddings.embeddings().device()
    }

    /// Masked-token predictor sharing this encoder's weights.
    pub fn predictor(&self) -> TiedTokenPredictor {
        TiedTokenPredictor::new(self.clone())
    }

    fn embed(
        &self,
        input: &EncoderInput<'_>,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<Tensor> {
        let (_, seq_len) = input.input_ids.dims2().map_err(|_| ContrastiveError::ShapeMismatch {
            context: format!("LookupEncoder expects (batch, seq_len) ids, got {:?}", input.input_ids.dims()),
        })?;
        if seq_len > self.config.max_position_embeddings {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!(
                    "seq_len {} exceeds max_position_embeddings {}",
                    seq_len, self.config.max_position_embeddings
                ),
            });
        }

        let device = self.device().clone();
        let aug = augmentation.copied().unwrap_or_default();
        let mut rng = self.rng.lock();

        let position_ids = match input.position_ids {
            Some(p) => p.clone(),
            None => Tensor::arange(0u32, seq_len as u32, &device).map_err(map_candle)?,
        };
        let position_ids = if aug.shuffle && seq_len > 2 {
            let mut tail: Vec<u32> = (1..seq_len as u32).collect();
            tail.shuffle(&mut *rng);
            let mut order = Vec::with_capacity(seq_len);
            order.push(0u32);
            order.extend(tail);
            let index = Tensor::from_vec(order, seq_len, &device).map_err(map_candle)?;
            position_ids
                .index_select(&index, position_ids.rank() - 1)
                .map_err(map_candle)?
        } else {
            position_ids
        };

        let mut embeddings = self
            .word_embeddings
            .forward(input.input_ids)
            .and_then(|w| {
                self.position_embeddings
                    .forward(&position_ids)
                    .and_then(|p| w.broadcast_add(&p))
            })
            .map_err(map_candle)?;

        if let (Some(tt), Some(table)) = (input.token_type_ids, &self.token_type_embeddings) {
            embeddings = table
                .forward(tt)
                .and_then(|t| embeddings.broadcast_add(&t))
                .map_err(map_candle)?;
        }

        if let Some(cutoff) = aug.cutoff.filter(|c| c.rate > 0.0) {
            let mask = cutoff_mask(cutoff, seq_len, self.config.hidden_size, &mut rng, &device)?;
            embeddings = embeddings.broadcast_mul(&mask).map_err(map_candle)?;
        }

        Ok(embeddings)
    }
}

impl Encoder for LookupEncoder {
    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn encode(
        &self,
        input: &EncoderInput<'_>,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<EncoderOutput> {
        if input.attention_mask.dims() != input.input_ids.dims() {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!(
                    "attention_mask {:?} does not match input_ids {:?}",
                    input.attention_mask.dims(),
                    input.input_ids.dims()
                ),
            });
        }

        let mut hidden = self.embed(input, augmentation)?;
        let mut stack = Vec::with_capacity(self.layers.len() + 1);
        if input.output_hidden_states {
            stack.push(hidden.clone());
        }

        for layer in &self.layers {
            hidden = layer
                .forward(&hidden)
                .and_then(|h| h.tanh())
                .and_then(|h| &hidden + h)
                .map_err(map_candle)?;
            if input.output_hidden_states {
                stack.push(hidden.clone());
            }
        }

        Ok(EncoderOutput {
            last_hidden_state: hidden,
            pooler_output: None,
            hidden_states: input.output_hidden_states.then_some(stack),
            attentions: None,
        })
    }
}

/// Multiplicative 0/1 mask, `(1, 1, hidden)` for columns or `(1, seq_len, 1)` for rows.
fn cutoff_mask(
    cutoff: Cutoff,
    seq_len: usize,
    hidden_size: usize,
    rng: &mut StdRng,
    device: &Device,
) -> ContrastiveResult<Tensor> {
    match cutoff.direction {
        CutoffDirection::Column => {
            let count = ((hidden_size as f32 * cutoff.rate) as usize).min(hidden_size);
            let mut keep = vec![1.0f32; hidden_size];
            for idx in rand::seq::index::sample(rng, hidden_size, count) {
                keep[idx] = 0.0;
            }
            Tensor::from_vec(keep, (1, 1, hidden_size), device).map_err(map_candle)
        }
        CutoffDirection::Row => {
            // position 0 carries the CLS token and is never cut
            let candidates = seq_len.saturating_sub(1);
            let count = ((candidates as f32 * cutoff.rate) as usize).min(candidates);
            let mut keep = vec![1.0f32; seq_len];
            for idx in rand::seq::index::sample(rng, candidates, count) {
                keep[idx + 1] = 0.0;
            }
            Tensor::from_vec(keep, (1, seq_len, 1), device).map_err(map_candle)
        }
    }
}

/// Predicts tokens by scoring final states against the encoder's word embeddings.
#[derive(Debug, Clone)]
pub struct TiedTokenPredictor {
    encoder: LookupEncoder,
}

impl TiedTokenPredictor {
    pub fn new(encoder: LookupEncoder) -> Self {
        Self { encoder }
    }
}

impl MaskedTokenPredictor for TiedTokenPredictor {
    fn vocab_size(&self) -> usize {
        self.encoder.config.vocab_size
    }

    fn predict_logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> ContrastiveResult<Tensor> {
        let input = EncoderInput {
            input_ids,
            attention_mask,
            token_type_ids: None,
            position_ids: None,
            output_hidden_states: false,
            output_attentions: false,
        };
        let out = self.encoder.encode(&input, None)?;
        let (batch, seq_len, hidden) = out.last_hidden_state.dims3().map_err(map_candle)?;
        let table = self.encoder.word_embeddings.embeddings();

        out.last_hidden_state
            .reshape((batch * seq_len, hidden))
            .and_then(|h| table.t().and_then(|tt| h.matmul(&tt)))
            .and_then(|logits| logits.reshape((batch, seq_len, self.vocab_size())))
            .map_err(map_candle)
    }
}

/// Map candle errors to ContrastiveError.
fn map_candle(e: candle_core::Error) -> ContrastiveError {
    ContrastiveError::TensorError {
        message: format!("LookupEncoder error: {}", e),
    }
}
