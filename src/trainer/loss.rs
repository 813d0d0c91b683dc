//! Per-microbatch loss records and their step/epoch level reduction.
//!
//! Only the terminal pipeline stage produces records. Every other stage
//! reports a default (0.0 for training, `None` for validation) and picks up
//! the canonical value through [`broadcast_from_last_rank`].

use std::collections::BTreeMap;

use crate::data::MicroBatch;
use crate::distributed::group::ProcessGroup;
use crate::distributed::topology::Topology;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Key under which the data-parallel averaged loss is stored.
pub const AVG_KEY: &str = "avg";

/// Named scalar tensors produced by the loss function for one microbatch.
pub struct LossReductionRecord<R: Runtime> {
    values: BTreeMap<String, Tensor<R>>,
}

impl<R: Runtime> Default for LossReductionRecord<R> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }
}

impl<R: Runtime> LossReductionRecord<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Tensor<R>) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Tensor<R>) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor<R>> {
        self.values.get(key)
    }

    /// Data-parallel averaged loss.
    pub fn avg(&self) -> Option<&Tensor<R>> {
        self.get(AVG_KEY)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What the loss function hands back to the scheduler for one microbatch.
pub struct LossOutput<R: Runtime> {
    /// Scalar loss of this microbatch on this replica, shape `[1]`.
    pub loss: Tensor<R>,
    /// Gradient of `loss` w.r.t. the terminal stage output (unscaled).
    pub output_grad: Tensor<R>,
    pub record: LossReductionRecord<R>,
}

/// Loss function applied on the terminal stage to the per-token losses.
pub type LossFn<'a, R> = dyn Fn(&MicroBatch<R>, &Tensor<R>) -> Result<LossOutput<R>> + 'a;

/// Read a scalar tensor back to the host as `f64`.
pub(crate) fn scalar_value<R, C>(client: &C, t: &Tensor<R>) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TypeConversionOps<R>,
{
    let as_f64 = if t.dtype() == DType::F64 {
        t.contiguous()
    } else {
        client.cast(t, DType::F64)?
    };
    as_f64
        .to_vec::<f64>()
        .first()
        .copied()
        .ok_or_else(|| Error::TrainingError {
            reason: "expected a scalar tensor, got an empty one".to_string(),
        })
}

/// Token-level masked mean: `sum(losses * mask) / sum(mask)`.
///
/// The returned record stores the loss averaged over `data_parallel` under
/// [`AVG_KEY`]. A mask that selects no tokens is a `DataError`.
pub fn masked_token_loss<R, C>(
    client: &C,
    data_parallel: &dyn ProcessGroup<R>,
    per_token_loss: &Tensor<R>,
    loss_mask: &Tensor<R>,
) -> Result<LossOutput<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + BinaryOps<R> + ReduceOps<R> + ScalarOps<R> + TypeConversionOps<R>,
{
    if per_token_loss.numel() != loss_mask.numel() {
        return Err(Error::ShapeMismatch {
            reason: format!(
                "per-token loss {:?} does not match loss mask {:?}",
                per_token_loss.shape(),
                loss_mask.shape()
            ),
        });
    }
    let n = per_token_loss.numel();
    let losses = client
        .cast(&per_token_loss.contiguous(), DType::F32)?
        .reshape(&[n])?;
    let mask = client
        .cast(&loss_mask.contiguous(), DType::F32)?
        .reshape(&[n])?;

    let tokens = scalar_value(client, &client.sum(&mask, &[0], false)?)?;
    if tokens <= 0.0 {
        return Err(Error::DataError {
            reason: "loss mask selects no tokens".to_string(),
        });
    }
    let inv_tokens = 1.0 / tokens;

    let masked = client.mul(&losses, &mask)?;
    let loss = client.mul_scalar(&client.sum(&masked, &[0], true)?, inv_tokens)?;

    let output_grad = client
        .mul_scalar(&mask, inv_tokens)?
        .reshape(per_token_loss.shape())?;
    let output_grad = if per_token_loss.dtype() == DType::F32 {
        output_grad
    } else {
        client.cast(&output_grad, per_token_loss.dtype())?
    };

    let summed = data_parallel.all_reduce(loss.clone())?;
    let avg = client.mul_scalar(&summed, 1.0 / data_parallel.world_size() as f64)?;

    Ok(LossOutput {
        loss,
        output_grad,
        record: LossReductionRecord::new().with(AVG_KEY, avg),
    })
}

fn mean_of_avgs<R, C>(client: &C, records: &[LossReductionRecord<R>]) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TypeConversionOps<R>,
{
    let mut total = 0.0;
    for (i, record) in records.iter().enumerate() {
        let avg = record.avg().ok_or_else(|| Error::TrainingError {
            reason: format!("loss record {i} has no '{AVG_KEY}' entry"),
        })?;
        total += scalar_value(client, avg)?;
    }
    Ok(total / records.len() as f64)
}

/// Mean of the per-microbatch averaged losses; 0.0 off the terminal stage.
pub fn reduce_train_loss<R, C>(client: &C, records: &[LossReductionRecord<R>]) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TypeConversionOps<R>,
{
    if records.is_empty() {
        return Ok(0.0);
    }
    mean_of_avgs(client, records)
}

/// Mean of the per-microbatch averaged losses; `None` off the terminal stage.
pub fn reduce_validation_loss<R, C>(
    client: &C,
    records: &[LossReductionRecord<R>],
) -> Result<Option<f64>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TypeConversionOps<R>,
{
    if records.is_empty() {
        return Ok(None);
    }
    mean_of_avgs(client, records).map(Some)
}

/// Every rank receives the last rank's `value`.
pub fn broadcast_from_last_rank<R>(topology: &Topology<R>, value: f64, device: &R::Device) -> Result<f64>
where
    R: Runtime<DType = DType>,
{
    let t = Tensor::<R>::from_slice(&[value], &[1], device);
    let out = topology.world.broadcast(t, topology.last_rank())?;
    out.to_vec::<f64>()
        .first()
        .copied()
        .ok_or_else(|| Error::DistributedError {
            reason: "broadcast returned an empty tensor".to_string(),
        })
}

/// Average per-step losses locally, then across the data-parallel group.
///
/// All members of a data-parallel group sit on the same pipeline stage, so
/// either all of them have losses or none do; `None` means none do.
pub fn validation_epoch_average<R>(
    data_parallel: &dyn ProcessGroup<R>,
    step_losses: &[f64],
    device: &R::Device,
) -> Result<Option<f64>>
where
    R: Runtime<DType = DType>,
{
    if step_losses.is_empty() {
        return Ok(None);
    }
    let local = step_losses.iter().sum::<f64>() / step_losses.len() as f64;
    let summed = data_parallel.all_reduce(Tensor::<R>::from_slice(&[local], &[1], device))?;
    let total = summed
        .to_vec::<f64>()
        .first()
        .copied()
        .ok_or_else(|| Error::DistributedError {
            reason: "all_reduce returned an empty tensor".to_string(),
        })?;
    Ok(Some(total / data_parallel.world_size() as f64))
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

    fn single(device: &numr::runtime::cpu::CpuDevice) -> CommGroup<CpuRuntime> {
        CommGroup::new(Arc::new(NoOpCommunicator), device.clone())
    }

    #[test]
    fn test_masked_token_loss() {
        let (client, device) = cpu_setup();
        let dp = single(&device);
        let losses = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 100.0], &[2, 2], &device);
        let mask = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0, 1.0, 0.0], &[2, 2], &device);

        let out = masked_token_loss(&client, &dp, &losses, &mask).unwrap();
        assert!((out.loss.to_vec::<f32>()[0] - 2.0).abs() < 1e-6);
        assert_eq!(out.output_grad.shape(), &[2, 2]);
        let g = out.output_grad.to_vec::<f32>();
        assert!((g[0] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(g[3], 0.0);
        assert!((out.record.avg().unwrap().to_vec::<f32>()[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_token_loss_rejects_empty_mask_and_shape_mismatch() {
        let (client, device) = cpu_setup();
        let dp = single(&device);
        let losses = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let zero = Tensor::<CpuRuntime>::from_slice(&[0.0f32, 0.0], &[2], &device);
        assert!(matches!(
            masked_token_loss(&client, &dp, &losses, &zero),
            Err(Error::DataError { .. })
        ));
        let short = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device);
        assert!(matches!(
            masked_token_loss(&client, &dp, &losses, &short),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_avg_is_data_parallel_mean() {
        let hub = LocalHub::new(2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let hub = Arc::clone(&hub);
                thread::spawn(move || {
                    let (client, device) = cpu_setup();
                    let dp = hub.member::<CpuRuntime>(rank, device.clone()).unwrap();
                    let v = if rank == 0 { 1.0f32 } else { 3.0 };
                    let losses = Tensor::<CpuRuntime>::from_slice(&[v, v], &[2], &device);
                    let mask = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0], &[2], &device);
                    let out = masked_token_loss(&client, &dp, &losses, &mask).unwrap();
                    (
                        out.loss.to_vec::<f32>()[0],
                        out.record.avg().unwrap().to_vec::<f32>()[0],
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0, 1.0);
        assert_eq!(results[1].0, 3.0);
        assert!(results.iter().all(|(_, avg)| (*avg - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_reduce_train_and_validation_loss() {
        let (client, device) = cpu_setup();
        let records: Vec<LossReductionRecord<CpuRuntime>> = [1.0f32, 2.0, 6.0]
            .iter()
            .map(|v| LossReductionRecord::new().with(AVG_KEY, Tensor::from_slice(&[*v], &[1], &device)))
            .collect();
        assert!((reduce_train_loss(&client, &records).unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(reduce_validation_loss(&client, &records).unwrap(), Some(3.0));

        let none: Vec<LossReductionRecord<CpuRuntime>> = Vec::new();
        assert_eq!(reduce_train_loss(&client, &none).unwrap(), 0.0);
        assert_eq!(reduce_validation_loss(&client, &none).unwrap(), None);

        let missing = vec![LossReductionRecord::<CpuRuntime>::new()];
        assert!(reduce_train_loss(&client, &missing).is_err());
    }

    #[test]
    fn test_broadcast_from_last_rank_across_pipeline() {
        let (_client, device) = cpu_setup();
        let grid = Topology::<CpuRuntime>::local_grid(1, 1, 3, &device).unwrap();
        let handles: Vec<_> = grid
            .into_iter()
            .map(|topo| {
                thread::spawn(move || {
                    let (_client, device) = cpu_setup();
                    let mine = if topo.is_last_stage() { 4.5 } else { 0.0 };
                    broadcast_from_last_rank(&topo, mine, &device).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 4.5);
        }
    }

    #[test]
    fn test_validation_epoch_average() {
        let hub = LocalHub::new(2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let hub = Arc::clone(&hub);
                thread::spawn(move || {
                    let (_client, device) = cpu_setup();
                    let dp = hub.member::<CpuRuntime>(rank, device.clone()).unwrap();
                    let steps = if rank == 0 { vec![1.0, 3.0] } else { vec![6.0] };
                    validation_epoch_average(&dp, &steps, &device).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(4.0));
        }
        let (_client, device) = cpu_setup();
        assert_eq!(validation_epoch_average(&single(&device), &[], &device).unwrap(), None);
    }
}
