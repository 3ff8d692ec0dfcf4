//! Loss terms of the contrastive objective.
//!
//! 1. InfoNCE over the in-batch similarity matrix (positives on the diagonal)
//! 2. Bank distillation: absolute mean entropy of the `z2`-vs-bank similarity
//!    distribution, weighted by `mlm_weight` when enabled

use candle_core::{Device, Tensor, D};

use crate::error::{ContrastiveError, ContrastiveResult};
use crate::models::Similarity;

/// Labels `0..n` pairing row `i` with column `i`.
pub fn diagonal_labels(n: usize, device: &Device) -> ContrastiveResult<Tensor> {
    Tensor::arange(0u32, n as u32, device).map_err(map_candle)
}

/// Cross-entropy of `cos_sim` `(N, M)` against `labels` `(N,)`, averaged over rows.
pub fn contrastive_loss(cos_sim: &Tensor, labels: &Tensor) -> ContrastiveResult<Tensor> {
    let (rows, cols) = cos_sim.dims2().map_err(map_candle)?;
    if rows == 0 || rows > cols {
        return Err(ContrastiveError::ShapeMismatch {
            context: format!(
                "similarity matrix {:?} cannot hold a positive for every row",
                cos_sim.dims()
            ),
        });
    }
    candle_nn::loss::cross_entropy(cos_sim, labels).map_err(map_candle)
}

/// `|mean_i Σ_k p_ik · log p_ik|` with `p = softmax(sim(z2, bank))`.
///
/// Both the probabilities and the log-probabilities come from their own
/// similarity computation over the same inputs. `bank` must already be
/// detached; gradients reach `z2` only.
pub fn bank_distillation_loss(z2: &Tensor, bank: &Tensor, sim: &Similarity) -> ContrastiveResult<Tensor> {
    let probs = candle_nn::ops::softmax(&sim.forward(z2, bank)?, D::Minus1).map_err(map_candle)?;
    let log_probs =
        candle_nn::ops::log_softmax(&sim.forward(z2, bank)?, D::Minus1).map_err(map_candle)?;

    // diag(P · log Pᵀ) without materialising the (N, N) product
    probs
        .mul(&log_probs)
        .and_then(|t| t.sum(1))
        .and_then(|t| t.mean_all())
        .and_then(|t| t.abs())
        .map_err(map_candle)
}

/// `contrastive + weight * bank`.
pub fn combine(contrastive: &Tensor, bank: &Tensor, weight: f32) -> ContrastiveResult<Tensor> {
    bank.affine(weight as f64, 0.0)
        .and_then(|scaled| contrastive.add(&scaled))
        .map_err(map_candle)
}

/// Extract a scalar f32 from a tensor.
pub fn tensor_to_f32(t: &Tensor) -> ContrastiveResult<f32> {
    t.to_dtype(candle_core::DType::F32)
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(map_candle)
}

/// Map candle errors to ContrastiveError.
fn map_candle(e: candle_core::Error) -> ContrastiveError {
    ContrastiveError::TensorError {
        message: format!("Loss computation error: {}", e),
    }
}
