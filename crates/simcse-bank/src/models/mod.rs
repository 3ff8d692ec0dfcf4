//! Parameter-free and learned building blocks shared by both forward pipelines.
//!
//! - [`pooler`]: token states → sentence vector
//! - [`projection`]: dense + tanh head over `cls` vectors
//! - [`similarity`]: temperature-scaled cosine similarity

pub mod pooler;
pub mod projection;
pub mod similarity;

pub use pooler::{masked_mean, Pooler};
pub use projection::ProjectionHead;
pub use similarity::{l2_normalize_rows, Similarity};
