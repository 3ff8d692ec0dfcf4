//! Contrastive sentence-embedding training with a rolling memory bank.
//!
//! This crate implements the forward side of SimCSE-style training on the
//! Candle backend: pooling, projection, temperature-scaled similarity, an
//! in-batch InfoNCE loss, and an auxiliary distillation loss against a
//! fixed-size memory bank of past anchor embeddings.
//!
//! # Architecture
//!
//! - **Encoder**: capability trait; any encoder producing per-token states plugs in
//! - **Pooler** / **ProjectionHead** / **Similarity**: shared building blocks
//! - **MemoryBank**: explicit owned circular buffer, borrowed `&mut` per step
//! - **ContrastiveModel**: the contrastive and sentence-embedding pipelines
//! - **Collective**: optional cross-worker gather for distributed training
//!
//! # Example
//!
//! ```rust
//! use simcse_bank::{ModelArgs, PoolerType};
//!
//! let args = ModelArgs::default();
//! assert_eq!(args.pooler_type, PoolerType::Cls);
//! assert!(args.validate().is_ok());
//! assert_eq!("avg_top2".parse::<PoolerType>().unwrap(), PoolerType::AvgTop2);
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod models;
pub mod training;
pub mod types;

pub use config::{ModelArgs, PoolerType};
pub use encoder::{Encoder, LookupEncoder, LookupEncoderConfig, MaskedTokenPredictor, TiedTokenPredictor};
pub use error::{ContrastiveError, ContrastiveResult};
pub use models::{Pooler, ProjectionHead, Similarity};
pub use training::{
    gather_with_local_grad, Collective, ContrastiveModel, ContrastiveOutput, ForwardRequest,
    LocalProcessGroup, MemoryBank, ModelOutput, SentenceEmbeddingOutput,
};
pub use types::{Augmentation, Cutoff, CutoffDirection, EncoderInput, EncoderOutput, TokenBatch};
