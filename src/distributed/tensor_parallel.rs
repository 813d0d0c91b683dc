//! Tensor-parallel shard helpers.
//!
//! The vocabulary projection of a tensor-parallel model produces logits
//! split along the last dimension. [`gather_along_dim`] reassembles the full
//! tensor on every rank; [`scatter_to_rank`] is the inverse used to build
//! a rank's shard.

use crate::distributed::group::ProcessGroup;
use crate::error::{Error, Result};
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

fn resolve_dim(dim: isize, ndim: usize) -> Result<usize> {
    let idx = if dim < 0 { ndim as isize + dim } else { dim };
    if idx < 0 || idx as usize >= ndim {
        return Err(Error::DistributedError {
            reason: format!("dim {dim} out of range for {ndim}D tensor"),
        });
    }
    Ok(idx as usize)
}

/// Split a tensor evenly across ranks along `dim` and return `rank`'s shard.
pub fn scatter_to_rank<R: Runtime>(
    tensor: &Tensor<R>,
    dim: isize,
    rank: usize,
    world_size: usize,
) -> Result<Tensor<R>> {
    let dim_idx = resolve_dim(dim, tensor.shape().len())?;
    let dim_size = tensor.shape()[dim_idx];
    if world_size == 0 || dim_size % world_size != 0 {
        return Err(Error::DistributedError {
            reason: format!(
                "dim {dim} size ({dim_size}) not divisible by world_size ({world_size})"
            ),
        });
    }
    let shard_size = dim_size / world_size;
    Ok(tensor
        .narrow(dim_idx, rank * shard_size, shard_size)?
        .contiguous())
}

/// All-gather shards from every rank of `group` and concatenate them along
/// `dim` in rank order.
pub fn gather_along_dim<R, C>(
    client: &C,
    group: &dyn ProcessGroup<R>,
    local_shard: &Tensor<R>,
    dim: isize,
) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + TensorOps<R>,
{
    if group.world_size() <= 1 {
        return Ok(local_shard.clone());
    }
    let dim_idx = resolve_dim(dim, local_shard.shape().len())?;
    let shards = group.all_gather(&local_shard.contiguous())?;
    if shards.len() != group.world_size() {
        return Err(Error::DistributedError {
            reason: format!(
                "all_gather returned {} shards for a group of {}",
                shards.len(),
                group.world_size()
            ),
        });
    }
    let refs: Vec<&Tensor<R>> = shards.iter().collect();
    Ok(client.cat(&refs, dim_idx as isize)?)
}
