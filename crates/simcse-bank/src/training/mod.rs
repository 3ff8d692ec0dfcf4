//! Contrastive training core.
//!
//! # Components
//!
//! - [`memory_bank`]: circular buffer of past anchor embeddings
//! - [`distributed`]: cross-worker gather that keeps the local gradient
//! - [`loss`]: InfoNCE and bank distillation terms
//! - [`forward`]: the contrastive and sentence-embedding pipelines
//! - [`output`]: tuple / named results of both pipelines
//!
//! One training step is a single [`ContrastiveModel::cl_forward`] call
//! followed by `loss.backward()`; optimizer stepping stays with the caller.

pub mod distributed;
pub mod forward;
pub mod loss;
pub mod memory_bank;
pub mod output;

pub use distributed::{gather_with_local_grad, Collective, LocalProcessGroup};
pub use forward::{ContrastiveModel, ForwardRequest};
pub use memory_bank::MemoryBank;
pub use output::{ContrastiveOutput, ModelOutput, SentenceEmbeddingOutput};
