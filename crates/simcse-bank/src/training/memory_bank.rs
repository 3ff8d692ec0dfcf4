//! Fixed-capacity circular buffer of past sentence embeddings.
//!
//! The bank is an owned resource: the contrastive forward pass borrows it
//! mutably for its single `enqueue` call and reads a detached copy for the
//! distillation loss. Nothing outside `enqueue` mutates it.
//!
//! ```text
//!   ptr ─┐
//!        v
//! [ b0 | b1 | b2 | b3 ]   enqueue(keys[batch]) writes rows [ptr, ptr+batch)
//!                         then ptr = (ptr + batch) % bank_size
//! ```
//!
//! # Invariants
//! - `queue` is `(bank_size, hidden_len)` for the lifetime of the bank
//! - `ptr < bank_size`
//! - every accepted batch size divides `bank_size`
//! - a rejected `enqueue` leaves `queue` and `ptr` untouched

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::config::ModelArgs;
use crate::error::{ContrastiveError, ContrastiveResult};
use crate::models::l2_normalize_rows;

const QUEUE_KEY: &str = "queue";
const PTR_KEY: &str = "queue_ptr";

/// Rolling memory bank of detached embeddings.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    queue: Tensor,
    ptr: usize,
    bank_size: usize,
    hidden_len: usize,
}

impl MemoryBank {
    /// Random rows drawn from N(0, 1), each L2-normalized.
    pub fn new(bank_size: usize, hidden_len: usize, device: &Device) -> ContrastiveResult<Self> {
        if bank_size == 0 || hidden_len == 0 {
            return Err(ContrastiveError::ConfigError {
                message: format!(
                    "memory bank needs bank_size > 0 and hidden_len > 0, got {} x {}",
                    bank_size, hidden_len
                ),
            });
        }
        let raw = Tensor::randn(0f32, 1f32, (bank_size, hidden_len), device).map_err(map_candle)?;
        let queue = l2_normalize_rows(&raw)?;

        tracing::info!(bank_size, hidden_len, "Memory bank initialized");

        Ok(Self {
            queue,
            ptr: 0,
            bank_size,
            hidden_len,
        })
    }

    /// Bank sized by `bank_size` x `hidden_len` from the model arguments.
    pub fn from_args(args: &ModelArgs, device: &Device) -> ContrastiveResult<Self> {
        Self::new(args.bank_size, args.hidden_len, device)
    }

    /// Adopt explicit `(bank_size, hidden_len)` contents with `ptr = 0`.
    ///
    /// Rows are stored as given (no normalization).
    pub fn from_tensor(queue: Tensor) -> ContrastiveResult<Self> {
        let (bank_size, hidden_len) = queue.dims2().map_err(|_| ContrastiveError::ShapeMismatch {
            context: format!("memory bank must be 2-D, got {:?}", queue.dims()),
        })?;
        if bank_size == 0 || hidden_len == 0 {
            return Err(ContrastiveError::ConfigError {
                message: format!("memory bank cannot be empty, got {} x {}", bank_size, hidden_len),
            });
        }
        Ok(Self {
            queue: queue.detach(),
            ptr: 0,
            bank_size,
            hidden_len,
        })
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    pub fn hidden_len(&self) -> usize {
        self.hidden_len
    }

    /// Next row to be overwritten.
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn queue(&self) -> &Tensor {
        &self.queue
    }

    /// Detached copy for loss computation; carries no gradient.
    pub fn snapshot(&self) -> ContrastiveResult<Tensor> {
        self.queue.detach().copy().map_err(map_candle)
    }

    /// Overwrite rows `[ptr, ptr + batch)` with `keys` and advance the pointer.
    ///
    /// Keys are detached before writing, so the bank never joins the
    /// autograd graph.
    ///
    /// # Errors
    /// - `ShapeMismatch` when `keys` is not 2-D
    /// - `DimensionMismatch` when `keys` width differs from `hidden_len`
    /// - `BankCapacity` when the batch is empty, does not divide `bank_size`,
    ///   or would run past the last row
    ///
    /// On error the bank and pointer are unchanged.
    pub fn enqueue(&mut self, keys: &Tensor) -> ContrastiveResult<()> {
        let (batch_size, width) = keys.dims2().map_err(|_| ContrastiveError::ShapeMismatch {
            context: format!("enqueue expects (batch, hidden) keys, got {:?}", keys.dims()),
        })?;
        if width != self.hidden_len {
            return Err(ContrastiveError::DimensionMismatch {
                expected: self.hidden_len,
                got: width,
            });
        }
        if batch_size == 0
            || self.bank_size % batch_size != 0
            || self.ptr + batch_size > self.bank_size
        {
            return Err(ContrastiveError::BankCapacity {
                bank_size: self.bank_size,
                batch_size,
                ptr: self.ptr,
            });
        }

        let keys = keys.detach().to_dtype(self.queue.dtype()).map_err(map_candle)?;
        let end = self.ptr + batch_size;

        let mut parts = Vec::with_capacity(3);
        if self.ptr > 0 {
            parts.push(self.queue.narrow(0, 0, self.ptr).map_err(map_candle)?);
        }
        parts.push(keys);
        if end < self.bank_size {
            parts.push(
                self.queue
                    .narrow(0, end, self.bank_size - end)
                    .map_err(map_candle)?,
            );
        }
        let updated = Tensor::cat(&parts, 0).map_err(map_candle)?;

        self.queue = updated;
        self.ptr = end % self.bank_size;

        tracing::debug!(batch_size, ptr = self.ptr, "Memory bank enqueue");
        Ok(())
    }

    /// Persist queue and pointer as a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> ContrastiveResult<()> {
        let path = path.as_ref();
        let ptr = Tensor::new(&[self.ptr as u32], self.queue.device()).map_err(map_candle)?;
        let tensors: HashMap<String, Tensor> = [
            (QUEUE_KEY.to_string(), self.queue.clone()),
            (PTR_KEY.to_string(), ptr),
        ]
        .into_iter()
        .collect();

        candle_core::safetensors::save(&tensors, path).map_err(|e| {
            ContrastiveError::SerializationError {
                message: format!("Failed to save memory bank to '{}': {}", path.display(), e),
            }
        })?;
        tracing::debug!(path = %path.display(), ptr = self.ptr, "Memory bank saved");
        Ok(())
    }

    /// Restore a bank written by [`MemoryBank::save`].
    pub fn load(path: impl AsRef<Path>, device: &Device) -> ContrastiveResult<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device).map_err(|e| {
            ContrastiveError::SerializationError {
                message: format!("Failed to load memory bank from '{}': {}", path.display(), e),
            }
        })?;

        let queue = tensors.remove(QUEUE_KEY).ok_or_else(|| ContrastiveError::SerializationError {
            message: format!("'{}' has no '{}' tensor", path.display(), QUEUE_KEY),
        })?;
        let ptr_tensor = tensors.remove(PTR_KEY).ok_or_else(|| ContrastiveError::SerializationError {
            message: format!("'{}' has no '{}' tensor", path.display(), PTR_KEY),
        })?;
        let ptr = ptr_tensor
            .to_dtype(DType::U32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(map_candle)?
            .first()
            .copied()
            .ok_or_else(|| ContrastiveError::SerializationError {
                message: format!("'{}' has an empty '{}' tensor", path.display(), PTR_KEY),
            })? as usize;

        let mut bank = Self::from_tensor(queue)?;
        if ptr >= bank.bank_size {
            return Err(ContrastiveError::SerializationError {
                message: format!("stored ptr {} out of range for bank_size {}", ptr, bank.bank_size),
            });
        }
        bank.ptr = ptr;
        Ok(bank)
    }
}

/// Map candle errors to ContrastiveError.
fn map_candle(e: candle_core::Error) -> ContrastiveError {
    ContrastiveError::TensorError {
        message: format!("Memory bank error: {}", e),
    }
}
