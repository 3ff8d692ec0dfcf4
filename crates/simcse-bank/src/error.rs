//! Error type for every failure in the contrastive training core.
//!
//! # Error Categories
//!
//! | Category | Variants | Caller Action |
//! |----------|----------|---------------|
//! | Configuration | ConfigError, UnsupportedPooler | Fix configuration |
//! | Precondition | BankCapacity, DimensionMismatch | Fix batch sizing |
//! | Contract | ShapeMismatch, MissingHiddenStates, MissingPredictor, TensorError | Fix collaborator wiring |
//! | Distributed | CollectiveError | Abort the step on every worker |
//! | Persistence | IoError, SerializationError | Fix paths / file contents |
//!
//! # Design Principles
//!
//! - **NO FALLBACKS**: Errors propagate to the caller, never silently degraded
//! - **FAIL FAST**: A failed precondition aborts the forward pass before any mutation
//! - **CONTEXTUAL**: Every variant names the operation or values involved

use thiserror::Error;

/// Error type for pooling, similarity, memory bank, and forward pipeline failures.
#[derive(Debug, Error)]
pub enum ContrastiveError {
    // === Configuration Errors ===
    /// Configuration file invalid or a value out of range.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Pooling mode outside the supported set.
    #[error("Pooler type not implemented: {pooler_type}")]
    UnsupportedPooler { pooler_type: String },

    // === Precondition Errors ===
    /// Memory bank capacity is not evenly divisible by the enqueued batch,
    /// or the write would run past the end of the bank.
    #[error("Memory bank capacity violation: bank_size {bank_size} cannot take a batch of {batch_size} at ptr {ptr}")]
    BankCapacity {
        bank_size: usize,
        batch_size: usize,
        ptr: usize,
    },

    /// Embedding width mismatch.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    // === Contract Errors ===
    /// Tensor shapes handed in by a caller or collaborator do not line up.
    #[error("Shape mismatch: {context}")]
    ShapeMismatch { context: String },

    /// Multi-layer pooling requested but the encoder returned no hidden-state stack.
    #[error("Pooler {pooler_type} needs at least {required} hidden-state layers, encoder returned {available}")]
    MissingHiddenStates {
        pooler_type: String,
        required: usize,
        available: usize,
    },

    /// MLM auxiliary ids supplied without a masked-token predictor.
    #[error("Masked-token predictor required for the MLM branch but none was supplied")]
    MissingPredictor,

    /// Candle tensor operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    // === Distributed Errors ===
    /// Collective communication failed (bad rank, poisoned group, shard mismatch).
    #[error("Collective error: {message}")]
    CollectiveError { message: String },

    // === Persistence Errors ===
    /// File I/O error (config files, bank snapshots).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization/deserialization failed (TOML, safetensors).
    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for contrastive training operations.
pub type ContrastiveResult<T> = Result<T, ContrastiveError>;

impl ContrastiveError {
    /// Returns true for errors caused by configuration rather than data.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ContrastiveError::ConfigError { .. } | ContrastiveError::UnsupportedPooler { .. }
        )
    }

    /// Wrap a candle error with the name of the failing operation.
    pub(crate) fn tensor(op: &str, e: candle_core::Error) -> Self {
        ContrastiveError::TensorError {
            message: format!("{}: {}", op, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_message() {
        let err = ContrastiveError::ConfigError {
            message: "temp must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("temp must be > 0"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_unsupported_pooler_is_not_implemented() {
        let err = ContrastiveError::UnsupportedPooler {
            pooler_type: "max".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("not implemented"));
        assert!(msg.contains("max"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_bank_capacity_message_carries_sizes() {
        let err = ContrastiveError::BankCapacity {
            bank_size: 16,
            batch_size: 3,
            ptr: 0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("16"));
        assert!(msg.contains("3"));
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_missing_hidden_states_message() {
        let err = ContrastiveError::MissingHiddenStates {
            pooler_type: "avg_top2".to_string(),
            required: 2,
            available: 0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("avg_top2"));
        assert!(msg.contains("2"));
    }

    #[test]
    fn test_io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "bank.safetensors");
        let err: ContrastiveError = io_err.into();
        assert!(format!("{}", err).contains("bank.safetensors"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_tensor_helper_names_operation() {
        let candle_err = candle_core::Error::Msg("boom".to_string());
        let err = ContrastiveError::tensor("pooler mask sum", candle_err);
        let msg = format!("{}", err);
        assert!(msg.contains("pooler mask sum"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ContrastiveError>();
    }
}
