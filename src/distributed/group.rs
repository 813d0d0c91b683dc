//! Process-group abstraction used by every collective in the crate.
//!
//! A [`ProcessGroup`] is a handle to a set of ranks owned by an external
//! topology service. The core never creates or tears down groups; it only
//! calls collectives on them. Two implementations ship with the crate:
//!
//! - [`CommGroup`]: adapter over numr's raw-pointer [`Communicator`]
//!   (NCCL/MPI backends, or `NoOpCommunicator` for a single process).
//! - [`LocalGroup`](super::local::LocalGroup): in-process group for ranks
//!   running on threads.
//!
//! Buffers handed to a collective may be reduced in place by the backend.
//! Callers pass freshly materialized tensors (flattened buckets, scalars).

use std::sync::Arc;

use crate::distributed::comm_utils::{
    all_reduce_tensor, broadcast_tensor, recv_tensor_with_metadata, send_tensor_with_metadata,
};
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

/// A communication group over which collectives and point-to-point
/// transfers are issued.
///
/// Every member must issue the same sequence of collectives; a mismatch is
/// fatal and surfaces as [`Error::DistributedError`] or a stall.
pub trait ProcessGroup<R: Runtime>: Send + Sync {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn world_size(&self) -> usize;

    /// Element-wise sum across all members. Every member receives the result.
    fn all_reduce(&self, tensor: Tensor<R>) -> Result<Tensor<R>>;

    /// Every member receives `root`'s tensor. Non-root members pass a tensor
    /// of the same shape and dtype.
    fn broadcast(&self, tensor: Tensor<R>, root: usize) -> Result<Tensor<R>>;

    /// Collect one tensor from each member, ordered by rank.
    fn all_gather(&self, tensor: &Tensor<R>) -> Result<Vec<Tensor<R>>>;

    /// Blocking send to `dest`.
    fn send(&self, tensor: &Tensor<R>, dest: usize, tag: u32) -> Result<()>;

    /// Blocking receive from `src`.
    fn recv(&self, src: usize, tag: u32) -> Result<Tensor<R>>;
}

/// Adapter exposing a numr [`Communicator`] as a [`ProcessGroup`].
pub struct CommGroup<R: Runtime> {
    comm: Arc<dyn Communicator>,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> CommGroup<R> {
    pub fn new(comm: Arc<dyn Communicator>, device: R::Device) -> Self {
        Self { comm, device }
    }

    pub fn communicator(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    fn sync(&self, what: &str) -> Result<()> {
        self.comm.sync().map_err(|e| Error::DistributedError {
            reason: format!("sync after {what} failed: {e}"),
        })
    }
}

impl<R> ProcessGroup<R> for CommGroup<R>
where
    R: Runtime<DType = DType>,
    R::Device: Send + Sync,
{
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    fn all_reduce(&self, tensor: Tensor<R>) -> Result<Tensor<R>> {
        if self.comm.world_size() <= 1 {
            return Ok(tensor);
        }
        let tensor = tensor.contiguous();
        all_reduce_tensor(self.comm.as_ref(), &tensor, ReduceOp::Sum)?;
        self.sync("all_reduce")?;
        Ok(tensor)
    }

    fn broadcast(&self, tensor: Tensor<R>, root: usize) -> Result<Tensor<R>> {
        if self.comm.world_size() <= 1 {
            return Ok(tensor);
        }
        let tensor = tensor.contiguous();
        broadcast_tensor(self.comm.as_ref(), &tensor, root)?;
        self.sync("broadcast")?;
        Ok(tensor)
    }

    fn all_gather(&self, tensor: &Tensor<R>) -> Result<Vec<Tensor<R>>> {
        let world_size = self.comm.world_size();
        if world_size <= 1 {
            return Ok(vec![tensor.clone()]);
        }

        let shard = tensor.contiguous();
        let count = shard.numel();
        let recv = Tensor::<R>::zeros(&[count * world_size], shard.dtype(), &self.device);

        // Safety: both buffers are contiguous; `recv` holds world_size * count elements
        unsafe {
            self.comm
                .all_gather(shard.data_ptr(), recv.data_ptr(), count, shard.dtype())
                .map_err(|e| Error::DistributedError {
                    reason: format!("all_gather failed: {e}"),
                })?;
        }
        self.sync("all_gather")?;

        let mut shards = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let part = recv
                .narrow(0, rank * count, count)?
                .contiguous()
                .reshape(shard.shape())?;
            shards.push(part);
        }
        Ok(shards)
    }

    fn send(&self, tensor: &Tensor<R>, dest: usize, tag: u32) -> Result<()> {
        let tensor = tensor.contiguous();
        send_tensor_with_metadata(self.comm.as_ref(), &tensor, dest, tag)
    }

    fn recv(&self, src: usize, tag: u32) -> Result<Tensor<R>> {
        recv_tensor_with_metadata::<R>(self.comm.as_ref(), src, tag, &self.device)
    }
}
