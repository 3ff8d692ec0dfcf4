//! Temperature-scaled cosine similarity.

use candle_core::Tensor;

use crate::error::{ContrastiveError, ContrastiveResult};

/// Lower bound on `‖x‖·‖y‖` in the cosine denominator.
const COSINE_EPS: f32 = 1e-8;

/// Pairwise `cos(x_i, y_j) / τ`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    temperature: f32,
}

impl Similarity {
    /// # Errors
    /// `ConfigError` unless `temperature` is finite and > 0.
    pub fn new(temperature: f32) -> ContrastiveResult<Self> {
        if !(temperature > 0.0) || !temperature.is_finite() {
            return Err(ContrastiveError::ConfigError {
                message: format!("similarity temperature must be > 0, got {}", temperature),
            });
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Compare every row of `x` `(rows, d)` against every row of `y` `(cols, d)`.
    ///
    /// Returns `(rows, cols)`.
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> ContrastiveResult<Tensor> {
        let (_, dx) = x.dims2().map_err(|e| ContrastiveError::tensor("similarity lhs", e))?;
        let (_, dy) = y.dims2().map_err(|e| ContrastiveError::tensor("similarity rhs", e))?;
        if dx != dy {
            return Err(ContrastiveError::DimensionMismatch {
                expected: dx,
                got: dy,
            });
        }

        let dot = y
            .t()
            .and_then(|yt| x.matmul(&yt))
            .map_err(|e| ContrastiveError::tensor("similarity matmul", e))?;

        let x_norm = row_norms(x)?;
        let y_norm = row_norms(y)?
            .t()
            .map_err(|e| ContrastiveError::tensor("similarity norm transpose", e))?;

        let denom = x_norm
            .broadcast_mul(&y_norm)
            .and_then(|d| d.clamp(COSINE_EPS, f32::MAX))
            .map_err(|e| ContrastiveError::tensor("similarity denominator", e))?;

        dot.div(&denom)
            .and_then(|cos| cos.affine(1.0 / self.temperature as f64, 0.0))
            .map_err(|e| ContrastiveError::tensor("similarity scale", e))
    }
}

/// `(n, 1)` L2 norms of each row.
fn row_norms(t: &Tensor) -> ContrastiveResult<Tensor> {
    t.sqr()
        .and_then(|s| s.sum_keepdim(1))
        .and_then(|s| s.sqrt())
        .map_err(|e| ContrastiveError::tensor("row norms", e))
}

/// Divide each row by its L2 norm (rows with zero norm stay zero).
pub fn l2_normalize_rows(t: &Tensor) -> ContrastiveResult<Tensor> {
    let norms = row_norms(t)?
        .clamp(COSINE_EPS, f32::MAX)
        .map_err(|e| ContrastiveError::tensor("normalize clamp", e))?;
    t.broadcast_div(&norms)
        .map_err(|e| ContrastiveError::tensor("normalize div", e))
}
