//! Gradient synchronization across data-parallel replicas.
//!
//! Gradients are grouped into one flat bucket per dtype, each bucket is
//! averaged with a single all-reduce, and the result is scattered back into
//! the gradient store. The bucket layout is a pure function of the parameter
//! list and the gradients present, so it can be rebuilt every step and is
//! identical on every replica.

use std::collections::HashMap;

use crate::distributed::group::ProcessGroup;
use crate::distributed::topology::Topology;
use crate::error::{Error, Result};
use crate::model::ParamMeta;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Position of one gradient inside a flat bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub id: TensorId,
    pub shape: Vec<usize>,
    pub numel: usize,
}

/// One bucket per gradient dtype, in first-seen order over the parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradientBuckets {
    buckets: Vec<(DType, Vec<BucketEntry>)>,
}

impl GradientBuckets {
    /// Lay out buckets for every trainable parameter that has a gradient.
    pub fn build<R>(params: &[ParamMeta], grads: &GradStore<R>) -> Self
    where
        R: Runtime<DType = DType>,
    {
        let mut buckets: Vec<(DType, Vec<BucketEntry>)> = Vec::new();
        for meta in params.iter().filter(|p| p.requires_grad) {
            let Some(grad) = grads.get(meta.id) else {
                continue;
            };
            let entry = BucketEntry {
                id: meta.id,
                shape: grad.shape().to_vec(),
                numel: grad.numel(),
            };
            match buckets.iter_mut().find(|(dt, _)| *dt == grad.dtype()) {
                Some((_, entries)) => entries.push(entry),
                None => buckets.push((grad.dtype(), vec![entry])),
            }
        }
        Self { buckets }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn dtypes(&self) -> Vec<DType> {
        self.buckets.iter().map(|(dt, _)| *dt).collect()
    }

    pub fn entries(&self, dtype: DType) -> Option<&[BucketEntry]> {
        self.buckets
            .iter()
            .find(|(dt, _)| *dt == dtype)
            .map(|(_, e)| e.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (DType, &[BucketEntry])> {
        self.buckets.iter().map(|(dt, e)| (*dt, e.as_slice()))
    }
}

/// Average gradients over `group` with one all-reduce per dtype bucket.
///
/// Each bucket is divided by the group size before the sum, so every replica
/// ends up holding the mean. A group of one leaves the gradients untouched.
pub fn all_reduce_bucketed<R, C>(
    client: &C,
    group: &dyn ProcessGroup<R>,
    params: &[ParamMeta],
    grads: &mut GradStore<R>,
) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R>,
{
    let world_size = group.world_size();
    if world_size <= 1 {
        return Ok(());
    }
    let buckets = GradientBuckets::build(params, grads);
    let scale = 1.0 / world_size as f64;

    for (dtype, entries) in buckets.iter() {
        let mut flats = Vec::with_capacity(entries.len());
        for entry in entries {
            let grad = grads.get(entry.id).ok_or_else(|| Error::DistributedError {
                reason: format!("gradient {:?} disappeared while bucketing", entry.id),
            })?;
            flats.push(grad.contiguous().reshape(&[entry.numel])?);
        }
        let refs: Vec<&Tensor<R>> = flats.iter().collect();
        let flat = client.cat(&refs, 0)?;
        let flat = client.mul_scalar(&flat, scale)?;
        let reduced = group.all_reduce(flat)?;

        let mut offset = 0usize;
        for entry in entries {
            let grad = reduced
                .narrow(0, offset, entry.numel)?
                .contiguous()
                .reshape(&entry.shape)?;
            grads.insert(entry.id, grad);
            offset += entry.numel;
        }
        tracing::trace!(%dtype, tensors = entries.len(), numel = offset, "all-reduced gradient bucket");
    }
    Ok(())
}

/// Sum the tied word-embedding gradient between the first and last stage.
///
/// Runs only when there is more than one pipeline stage, this rank is on the
/// first or last stage, embeddings are shared, and a gradient exists for
/// `embedding`. Returns whether a reduction happened.
pub fn all_reduce_shared_embedding<R: Runtime>(
    topology: &Topology<R>,
    grads: &mut GradStore<R>,
    embedding: Option<TensorId>,
    share_word_embeddings: bool,
) -> Result<bool> {
    if topology.pipeline_parallel_size <= 1
        || !share_word_embeddings
        || !(topology.is_first_stage() || topology.is_last_stage())
    {
        return Ok(false);
    }
    let Some(id) = embedding else {
        return Ok(false);
    };
    let Some(grad) = grads.get(id) else {
        return Ok(false);
    };
    let group = topology
        .embedding
        .as_ref()
        .ok_or_else(|| Error::DistributedError {
            reason: format!(
                "pipeline stage {} shares embeddings but has no embedding group",
                topology.pipeline_rank
            ),
        })?;
    let reduced = group.all_reduce(grad.contiguous())?;
    grads.insert(id, reduced);
    Ok(true)
}

/// Broadcast parameters from `root` so every replica starts identical.
///
/// Parameters are visited in `params` order, which must match on every rank.
pub fn broadcast_params<R: Runtime>(
    group: &dyn ProcessGroup<R>,
    params: &[ParamMeta],
    values: &mut HashMap<TensorId, Tensor<R>>,
    root: usize,
) -> Result<()> {
    if group.world_size() <= 1 {
        return Ok(());
    }
    for meta in params {
        let Some(tensor) = values.get(&meta.id) else {
            continue;
        };
        let synced = group.broadcast(tensor.contiguous(), root)?;
        values.insert(meta.id, synced);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::group::CommGroup;
    use crate::distributed::local::LocalHub;
    use crate::test_utils::cpu_setup;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::CpuRuntime;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_buckets_group_by_dtype_in_param_order() {
        let (_client, device) = cpu_setup();
        let (a, b, c, frozen) = (TensorId::new(), TensorId::new(), TensorId::new(), TensorId::new());
        let params = vec![
            ParamMeta::new("a.weight", a),
            ParamMeta::new("b.weight", b),
            ParamMeta::new("c.weight", c),
            ParamMeta::new("frozen.weight", frozen).frozen(),
        ];
        let mut grads = GradStore::<CpuRuntime>::new();
        grads.insert(a, Tensor::from_slice(&[1.0f64, 2.0], &[2], &device));
        grads.insert(b, Tensor::from_slice(&[1.0f32; 6], &[2, 3], &device));
        grads.insert(c, Tensor::from_slice(&[3.0f64], &[1], &device));
        grads.insert(frozen, Tensor::from_slice(&[9.0f32], &[1], &device));

        let buckets = GradientBuckets::build(&params, &grads);
        assert_eq!(buckets.dtypes(), vec![DType::F64, DType::F32]);
        let f64s = buckets.entries(DType::F64).unwrap();
        assert_eq!(f64s.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, c]);
        let f32s = buckets.entries(DType::F32).unwrap();
        assert_eq!(f32s.len(), 1);
        assert_eq!(f32s[0].shape, vec![2, 3]);
        assert_eq!(f32s[0].numel, 6);

        // Rebuilding yields the same layout
        assert_eq!(GradientBuckets::build(&params, &grads), buckets);
    }

    #[test]
    fn test_single_replica_leaves_grads_unchanged() {
        let (client, device) = cpu_setup();
        let group = CommGroup::<CpuRuntime>::new(Arc::new(NoOpCommunicator), device.clone());
        let id = TensorId::new();
        let params = vec![ParamMeta::new("w", id)];
        let mut grads = GradStore::new();
        grads.insert(id, Tensor::<CpuRuntime>::from_slice(&[2.0f32, 4.0], &[2], &device));

        all_reduce_bucketed(&client, &group, &params, &mut grads).unwrap();
        assert_eq!(grads.get(id).unwrap().to_vec::<f32>(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_two_replicas_average() {
        let hub = LocalHub::new(2).unwrap();
        let ids = (TensorId::new(), TensorId::new());
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let hub = Arc::clone(&hub);
                thread::spawn(move || {
                    let (client, device) = cpu_setup();
                    let group = hub.member::<CpuRuntime>(rank, device.clone()).unwrap();
                    let params = vec![ParamMeta::new("w", ids.0), ParamMeta::new("b.bias", ids.1)];
                    let r = rank as f32;
                    let mut grads = GradStore::new();
                    grads.insert(ids.0, Tensor::<CpuRuntime>::from_slice(&[r, 2.0 * r, 4.0, 6.0], &[2, 2], &device));
                    grads.insert(ids.1, Tensor::<CpuRuntime>::from_slice(&[10.0 * r], &[1], &device));
                    all_reduce_bucketed(&client, &group, &params, &mut grads).unwrap();
                    (
                        grads.get(ids.0).unwrap().to_vec::<f32>(),
                        grads.get(ids.0).unwrap().shape().to_vec(),
                        grads.get(ids.1).unwrap().to_vec::<f32>(),
                    )
                })
            })
            .collect();
        for h in handles {
            let (w, shape, b) = h.join().unwrap();
            assert_eq!(w, vec![0.5, 1.0, 4.0, 6.0]);
            assert_eq!(shape, vec![2, 2]);
            assert_eq!(b, vec![5.0]);
        }
    }

    #[test]
    fn test_shared_embedding_skipped_for_single_stage() {
        let (_client, device) = cpu_setup();
        let grid = Topology::<CpuRuntime>::local_grid(1, 1, 1, &device).unwrap();
        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(id, Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device));
        assert!(!all_reduce_shared_embedding(&grid[0], &mut grads, Some(id), true).unwrap());
    }

    #[test]
    fn test_shared_embedding_sums_first_and_last() {
        let (_client, device) = cpu_setup();
        let grid = Topology::<CpuRuntime>::local_grid(1, 1, 3, &device).unwrap();
        let id = TensorId::new();
        let handles: Vec<_> = grid
            .into_iter()
            .map(|topo| {
                thread::spawn(move || {
                    let (_client, device) = cpu_setup();
                    let mut grads = GradStore::new();
                    let v = topo.pipeline_rank as f32 + 1.0;
                    grads.insert(id, Tensor::<CpuRuntime>::from_slice(&[v], &[1], &device));
                    let ran = all_reduce_shared_embedding(&topo, &mut grads, Some(id), true).unwrap();
                    (topo.pipeline_rank, ran, grads.get(id).unwrap().to_vec::<f32>()[0])
                })
            })
            .collect();
        for h in handles {
            let (stage, ran, value) = h.join().unwrap();
            match stage {
                1 => assert!(!ran && value == 2.0),
                _ => assert!(ran && value == 4.0),
            }
        }
    }

    #[test]
    fn test_broadcast_params_single_rank_noop() {
        let (_client, device) = cpu_setup();
        let group = CommGroup::<CpuRuntime>::new(Arc::new(NoOpCommunicator), device.clone());
        let id = TensorId::new();
        let params = vec![ParamMeta::new("w", id)];
        let mut values = HashMap::new();
        values.insert(id, Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device));
        broadcast_params(&group, &params, &mut values, 0).unwrap();
        assert_eq!(values[&id].to_vec::<f32>(), vec![1.0, 2.0]);
    }
}
