//! Process-group handle over an external collective-communication backend.
//!
//! The harness never performs network I/O: the launcher that spawned this
//! worker initializes a backend (NCCL-style ring, TCP rendezvous, whatever)
//! and hands it in behind [`Collective`]. A `None` process group in
//! [`crate::model_to_ddp`] means no backend was initialized and training is
//! single-process.

use std::sync::Arc;

use candle_core::{Result, Tensor};

/// The external backend contract: world layout plus one blocking
/// sum-all-reduce over a flat bucket. Any blocking or cancellation behavior
/// belongs to the implementation, not to the callers here.
pub trait Collective: Send + Sync {
    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    /// Element-wise sum of `bucket` across all workers; every worker gets
    /// the full result.
    fn all_reduce_sum(&self, bucket: &Tensor) -> Result<Tensor>;
}

/// An initialized process group. Cheap to clone; all clones share the same
/// backend.
#[derive(Clone)]
pub struct ProcessGroup {
    backend: Arc<dyn Collective>,
}

impl ProcessGroup {
    pub fn new(backend: Arc<dyn Collective>) -> Self {
        Self { backend }
    }

    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    pub fn all_reduce_sum(&self, bucket: &Tensor) -> Result<Tensor> {
        self.backend.all_reduce_sum(bucket)
    }
}
