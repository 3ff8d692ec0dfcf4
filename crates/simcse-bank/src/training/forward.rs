//! Contrastive and sentence-embedding forward pipelines.
//!
//! # Contrastive pass
//!
//! ```text
//! (batch, views, seq) ──┬─ view 2 + stronger augmentation ─> pool ─> [mlp] ─> stronger
//!                       │
//!                       └─ views 0..2 ─ flatten ─ encode ─ pool ─ [mlp] ─> z1, z2
//!
//! mlm ids ─ predictor argmax ─ re-encode ─ pool ─> z3      enqueue(z1)
//! [gather z1, z2, z3 across workers]
//! loss = CE(sim(z1, z2), 0..N) [+ mlm_weight * bank_loss(z2, bank)]
//! ```
//!
//! The memory bank is borrowed mutably for the duration of the pass and
//! enqueued at most once.

use std::sync::Arc;

use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::ModelArgs;
use crate::encoder::{Encoder, MaskedTokenPredictor};
use crate::error::{ContrastiveError, ContrastiveResult};
use crate::models::{Pooler, ProjectionHead, Similarity};
use crate::types::{Augmentation, EncoderOutput, TokenBatch};

use super::distributed::{gather_with_local_grad, Collective};
use super::loss::{bank_distillation_loss, combine, contrastive_loss, diagonal_labels};
use super::memory_bank::MemoryBank;
use super::output::{ContrastiveOutput, ModelOutput, SentenceEmbeddingOutput};

/// Arguments of [`ContrastiveModel::forward`].
#[derive(Debug, Clone, Copy)]
pub struct ForwardRequest<'a> {
    pub batch: &'a TokenBatch,
    /// Auxiliary ids for the MLM branch, `(batch, views, seq)` or `(batch, seq)`.
    pub mlm_input_ids: Option<&'a Tensor>,
    /// Route to the sentence-embedding pipeline.
    pub sent_emb: bool,
    /// Overrides `ModelArgs::use_return_dict` for this call.
    pub return_dict: Option<bool>,
}

impl<'a> ForwardRequest<'a> {
    pub fn contrastive(batch: &'a TokenBatch) -> Self {
        Self {
            batch,
            mlm_input_ids: None,
            sent_emb: false,
            return_dict: None,
        }
    }

    pub fn sentence_embedding(batch: &'a TokenBatch) -> Self {
        Self {
            sent_emb: true,
            ..Self::contrastive(batch)
        }
    }

    pub fn with_mlm_input_ids(mut self, mlm_input_ids: &'a Tensor) -> Self {
        self.mlm_input_ids = Some(mlm_input_ids);
        self
    }

    pub fn with_return_dict(mut self, return_dict: bool) -> Self {
        self.return_dict = Some(return_dict);
        self
    }
}

/// Sentence-embedding model trained with an in-batch contrastive objective.
///
/// Generic over the encoder; pooling, projection and similarity are shared by
/// every encoder family.
pub struct ContrastiveModel<E: Encoder> {
    encoder: E,
    args: ModelArgs,
    pooler: Pooler,
    mlp: Option<ProjectionHead>,
    sim: Similarity,
    collective: Option<Arc<dyn Collective>>,
    training: bool,
    output_attentions: bool,
}

impl<E: Encoder> ContrastiveModel<E> {
    /// Build the model around `encoder`.
    ///
    /// The projection head (only for `cls` pooling) registers its weights
    /// under `mlp` in `vb`.
    ///
    /// # Errors
    /// - `ConfigError` for invalid arguments or when `hidden_len` differs
    ///   from the encoder's hidden size
    pub fn new(encoder: E, args: ModelArgs, vb: VarBuilder) -> ContrastiveResult<Self> {
        args.validate()?;
        let hidden_size = encoder.hidden_size();
        if args.hidden_len != hidden_size {
            return Err(ContrastiveError::ConfigError {
                message: format!(
                    "hidden_len {} does not match encoder hidden size {}",
                    args.hidden_len, hidden_size
                ),
            });
        }

        let mlp = if args.pooler_type.uses_projection() {
            Some(ProjectionHead::new(hidden_size, vb.pp("mlp"))?)
        } else {
            None
        };
        let sim = Similarity::new(args.temp)?;

        if args.hard_negative_weight != 0.0 {
            tracing::warn!(
                hard_negative_weight = args.hard_negative_weight,
                "hard_negative_weight is set but does not enter the loss"
            );
        }
        tracing::info!(
            pooler_type = %args.pooler_type,
            temp = args.temp,
            bank_size = args.bank_size,
            do_mlm = args.do_mlm,
            do_stronger = args.do_stronger,
            generator = args.generator_name.as_deref().unwrap_or("none"),
            "Contrastive model created"
        );

        Ok(Self {
            encoder,
            pooler: Pooler::new(args.pooler_type),
            args,
            mlp,
            sim,
            collective: None,
            training: true,
            output_attentions: false,
        })
    }

    /// Gather embeddings across the workers of `collective` during training.
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = Some(collective);
        self
    }

    /// Ask the encoder for attention maps.
    pub fn with_output_attentions(mut self, output_attentions: bool) -> Self {
        self.output_attentions = output_attentions;
        self
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn pooler(&self) -> &Pooler {
        &self.pooler
    }

    pub fn projection(&self) -> Option<&ProjectionHead> {
        self.mlp.as_ref()
    }

    pub fn similarity(&self) -> &Similarity {
        &self.sim
    }

    /// Dispatch on `request.sent_emb`.
    pub fn forward(
        &self,
        request: ForwardRequest<'_>,
        bank: &mut MemoryBank,
        predictor: Option<&dyn MaskedTokenPredictor>,
    ) -> ContrastiveResult<ModelOutput> {
        if request.sent_emb {
            self.sentemb_forward(request.batch, request.return_dict)
        } else {
            self.cl_forward(
                request.batch,
                request.mlm_input_ids,
                bank,
                predictor,
                request.return_dict,
            )
        }
    }

    /// Contrastive training pass over a `(batch, views, seq_len)` batch.
    ///
    /// # Errors
    /// - `ShapeMismatch` for fewer than two views, or fewer than three with `do_stronger`
    /// - `DimensionMismatch` when the bank width differs from the encoder width
    /// - `MissingPredictor` when `mlm_input_ids` is given without a predictor
    /// - `BankCapacity` when the batch size does not divide the bank
    /// - `CollectiveError` from the cross-worker gather
    pub fn cl_forward(
        &self,
        batch: &TokenBatch,
        mlm_input_ids: Option<&Tensor>,
        bank: &mut MemoryBank,
        predictor: Option<&dyn MaskedTokenPredictor>,
        return_dict: Option<bool>,
    ) -> ContrastiveResult<ModelOutput> {
        let return_dict = return_dict.unwrap_or(self.args.use_return_dict);
        batch.check_shapes()?;
        let batch_size = batch.batch_size()?;
        let input_views = batch.num_views()?;
        if input_views < 2 {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!("contrastive batch needs at least 2 views, got {}", input_views),
            });
        }
        let hidden_size = self.encoder.hidden_size();
        if bank.hidden_len() != hidden_size {
            return Err(ContrastiveError::DimensionMismatch {
                expected: hidden_size,
                got: bank.hidden_len(),
            });
        }
        if mlm_input_ids.is_some() && predictor.is_none() {
            return Err(ContrastiveError::MissingPredictor);
        }

        let (working, stronger) = if self.args.do_stronger {
            if input_views < 3 {
                return Err(ContrastiveError::ShapeMismatch {
                    context: format!("do_stronger needs a third view, got {} views", input_views),
                });
            }
            let view = batch.view(2)?;
            let augmentation = Augmentation::stronger(self.args.cutoff_rate);
            let (_, pooled) = self.encode_and_pool(&view, Some(&augmentation))?;
            (batch.take_views(2)?, Some(self.project(pooled)?))
        } else {
            (batch.clone(), None)
        };
        let num_views = working.num_views()?;

        let flat = working.flatten_views()?;
        let (outputs, pooled) = self.encode_and_pool(&flat, None)?;
        let pooled = self.project(pooled)?;
        let width = pooled.dim(D::Minus1).map_err(map_candle)?;
        let pooled = pooled
            .reshape((batch_size, num_views, width))
            .map_err(map_candle)?;

        let z1 = pooled.i((.., 0)).and_then(|t| t.contiguous()).map_err(map_candle)?;
        let z2 = pooled.i((.., 1)).and_then(|t| t.contiguous()).map_err(map_candle)?;

        let z3 = match (mlm_input_ids, predictor) {
            (Some(mlm_input_ids), Some(predictor)) => {
                let anchor = working.view(0)?;
                let z3 = self.reconstruct_and_pool(mlm_input_ids, &anchor, predictor)?;
                bank.enqueue(&z1)?;
                Some(z3)
            }
            _ if stronger.is_some() => {
                bank.enqueue(&z1)?;
                stronger
            }
            _ => None,
        };

        let (z1, z2, z3) = match (&self.collective, self.training) {
            (Some(collective), true) => {
                let collective: &dyn Collective = collective.as_ref();
                // gated on the caller's view count, before stronger-branch truncation
                let z3 = match z3 {
                    Some(z3) if input_views >= 3 => Some(gather_with_local_grad(collective, &z3)?),
                    other => other,
                };
                let z1 = gather_with_local_grad(collective, &z1)?;
                let z2 = gather_with_local_grad(collective, &z2)?;
                (z1, z2, z3)
            }
            _ => (z1, z2, z3),
        };

        let cos_sim = self.sim.forward(&z1, &z2)?;
        let rows = cos_sim.dim(0).map_err(map_candle)?;
        let labels = diagonal_labels(rows, cos_sim.device())?;
        let cl_loss = contrastive_loss(&cos_sim, &labels)?;

        let (loss, bank_loss) = if self.args.uses_bank_loss() {
            let queue = bank.snapshot()?;
            let ld_loss = bank_distillation_loss(&z2, &queue, &self.sim)?;
            (combine(&cl_loss, &ld_loss, self.args.mlm_weight)?, Some(ld_loss))
        } else {
            (cl_loss.clone(), None)
        };

        tracing::debug!(
            batch_size,
            num_views,
            rows,
            bank_ptr = bank.ptr(),
            augmented = z3.is_some(),
            "Contrastive forward pass"
        );

        let output = ContrastiveOutput {
            loss,
            logits: cos_sim,
            labels,
            contrastive_loss: cl_loss,
            bank_loss,
            augmented: z3,
            hidden_states: outputs.hidden_states,
            attentions: outputs.attentions,
        };
        Ok(if return_dict {
            ModelOutput::Contrastive(output)
        } else {
            ModelOutput::Tuple(output.into_tuple())
        })
    }

    /// Inference pass over a `(batch, seq_len)` batch; no loss, no bank access.
    pub fn sentemb_forward(
        &self,
        batch: &TokenBatch,
        return_dict: Option<bool>,
    ) -> ContrastiveResult<ModelOutput> {
        let return_dict = return_dict.unwrap_or(self.args.use_return_dict);
        batch.check_shapes()?;
        if batch.input_ids.rank() != 2 {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!(
                    "sentence embedding expects (batch, seq_len) ids, got {:?}",
                    batch.input_ids.dims()
                ),
            });
        }

        let (outputs, pooled) = self.encode_and_pool(batch, None)?;
        let pooler_output = if self.args.mlp_only_train {
            pooled
        } else {
            self.project(pooled)?
        };

        let output = SentenceEmbeddingOutput {
            pooler_output,
            last_hidden_state: outputs.last_hidden_state,
            hidden_states: outputs.hidden_states,
            attentions: outputs.attentions,
        };
        Ok(if return_dict {
            ModelOutput::SentenceEmbedding(output)
        } else {
            ModelOutput::Tuple(output.into_tuple())
        })
    }

    /// `(batch, hidden)` sentence vectors for a `(batch, seq_len)` batch.
    pub fn embed(&self, batch: &TokenBatch) -> ContrastiveResult<Tensor> {
        match self.sentemb_forward(batch, Some(true))? {
            ModelOutput::SentenceEmbedding(out) => Ok(out.pooler_output),
            _ => Err(ContrastiveError::ShapeMismatch {
                context: "sentence embedding pass returned no pooled output".to_string(),
            }),
        }
    }

    fn encode_and_pool(
        &self,
        batch: &TokenBatch,
        augmentation: Option<&Augmentation>,
    ) -> ContrastiveResult<(EncoderOutput, Tensor)> {
        let mut input = batch.as_encoder_input(self.pooler.pooler_type().needs_hidden_states());
        input.output_attentions = self.output_attentions;
        let outputs = self.encoder.encode(&input, augmentation)?;
        let pooled = self.pooler.forward(&batch.attention_mask, &outputs)?;
        Ok((outputs, pooled))
    }

    fn project(&self, pooled: Tensor) -> ContrastiveResult<Tensor> {
        match &self.mlp {
            Some(mlp) => mlp.forward(&pooled),
            None => Ok(pooled),
        }
    }

    /// Replace the anchor tokens with the predictor's arg-max, force the CLS
    /// id at position 0, zero the padding, and pool the re-encoded result.
    fn reconstruct_and_pool(
        &self,
        mlm_input_ids: &Tensor,
        anchor: &TokenBatch,
        predictor: &dyn MaskedTokenPredictor,
    ) -> ContrastiveResult<Tensor> {
        let ids = match mlm_input_ids.rank() {
            3 => mlm_input_ids
                .i((.., 0))
                .and_then(|t| t.contiguous())
                .map_err(map_candle)?,
            _ => mlm_input_ids.clone(),
        };
        if ids.dims() != anchor.input_ids.dims() {
            return Err(ContrastiveError::ShapeMismatch {
                context: format!(
                    "mlm_input_ids view {:?} does not match anchor ids {:?}",
                    ids.dims(),
                    anchor.input_ids.dims()
                ),
            });
        }

        let predicted = predictor
            .predict_logits(&ids, &anchor.attention_mask)?
            .detach()
            .argmax(D::Minus1)
            .map_err(map_candle)?;
        let (rows, seq_len) = predicted.dims2().map_err(map_candle)?;

        let cls = Tensor::full(self.args.cls_token_id, (rows, 1), predicted.device())
            .map_err(map_candle)?;
        let forced = if seq_len > 1 {
            predicted
                .narrow(1, 1, seq_len - 1)
                .and_then(|rest| Tensor::cat(&[&cls, &rest], 1))
                .map_err(map_candle)?
        } else {
            cls
        };
        let reconstructed = anchor
            .attention_mask
            .to_dtype(DType::U32)
            .and_then(|mask| forced.mul(&mask))
            .map_err(map_candle)?;

        let batch = TokenBatch {
            input_ids: reconstructed,
            attention_mask: anchor.attention_mask.clone(),
            token_type_ids: anchor.token_type_ids.clone(),
            position_ids: anchor.position_ids.clone(),
        };
        let (_, pooled) = self.encode_and_pool(&batch, None)?;
        Ok(pooled)
    }
}

/// Map candle errors to ContrastiveError.
fn map_candle(e: candle_core::Error) -> ContrastiveError {
    ContrastiveError::TensorError {
        message: format!("Forward pass error: {}", e),
    }
}
