//! Cross-worker gathering of sentence embeddings.
//!
//! A [`Collective`] all-gathers detached shards. [`gather_with_local_grad`]
//! then puts the caller's own gradient-carrying tensor back into its rank slot
//! before concatenating, so the loss over the global batch back-propagates
//! into the local encoder only.
//!
//! Every worker must call the collective the same number of times with
//! same-shaped tensors. A worker that skips a call leaves the others blocked;
//! there is no timeout.

use std::sync::{Arc, Barrier};

use candle_core::Tensor;
use parking_lot::Mutex;

use crate::error::{ContrastiveError, ContrastiveResult};

/// Process-group capability consumed by the contrastive pipeline.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocking all-gather. Returns one detached tensor per rank, in rank order.
    fn all_gather(&self, tensor: &Tensor) -> ContrastiveResult<Vec<Tensor>>;
}

struct GroupState {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// In-process process group: one handle per worker thread.
///
/// Created with [`LocalProcessGroup::new_group`]; handle `i` has rank `i`.
#[derive(Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    state: Arc<GroupState>,
}

impl std::fmt::Debug for LocalProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl LocalProcessGroup {
    /// Handles for ranks `0..world_size`.
    pub fn new_group(world_size: usize) -> ContrastiveResult<Vec<Self>> {
        if world_size == 0 {
            return Err(ContrastiveError::CollectiveError {
                message: "world_size must be at least 1".to_string(),
            });
        }
        let state = Arc::new(GroupState {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        tracing::debug!(world_size, "Local process group created");
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                state: Arc::clone(&state),
            })
            .collect())
    }
}

impl Collective for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor) -> ContrastiveResult<Vec<Tensor>> {
        self.state.slots.lock()[self.rank] = Some(tensor.detach());
        self.state.barrier.wait();

        let gathered: Option<Vec<Tensor>> = self.state.slots.lock().iter().cloned().collect();

        // nobody may overwrite a slot until every rank has read all of them
        self.state.barrier.wait();

        let shards = gathered.ok_or_else(|| ContrastiveError::CollectiveError {
            message: format!("rank {} found an empty slot after the barrier", self.rank),
        })?;
        if let Some((peer, shard)) = shards
            .iter()
            .enumerate()
            .find(|(_, shard)| shard.dims() != tensor.dims())
        {
            return Err(ContrastiveError::CollectiveError {
                message: format!(
                    "rank {} sent {:?} but rank {} sent {:?}",
                    self.rank,
                    tensor.dims(),
                    peer,
                    shard.dims()
                ),
            });
        }
        Ok(shards)
    }
}

/// All-gather `tensor`, splice the local (gradient-carrying) tensor into this
/// rank's slot and concatenate along dimension 0.
///
/// Output is `(world_size * batch, ...)` in rank order.
pub fn gather_with_local_grad(collective: &dyn Collective, tensor: &Tensor) -> ContrastiveResult<Tensor> {
    let mut shards = collective.all_gather(tensor)?;
    let rank = collective.rank();
    if rank >= shards.len() {
        return Err(ContrastiveError::CollectiveError {
            message: format!("rank {} out of range for {} gathered shards", rank, shards.len()),
        });
    }
    shards[rank] = tensor.clone();

    Tensor::cat(&shards, 0).map_err(|e| ContrastiveError::CollectiveError {
        message: format!("Failed to concatenate gathered shards: {}", e),
    })
}
