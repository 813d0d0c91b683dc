//! Mixed precision bookkeeping around the optimizer step.
//!
//! - [`MasterParams`]: fp32 master weights for the O2 path. The stage keeps
//!   computing in half precision; gradients are cast up, reduced and applied
//!   to the masters, and the result is cast back into the stage.
//! - [`MixedPrecisionCoordinator`]: keeps LR schedulers and the step budget
//!   honest when the loss scaler skips an optimizer update.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::optimizer::{GradScaler, LrScheduler};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::TypeConversionOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Undo the LR-scheduler step taken for an update the scaler skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixedPrecisionCoordinator {
    max_steps: Option<u64>,
}

impl MixedPrecisionCoordinator {
    pub fn new(max_steps: Option<u64>) -> Self {
        Self { max_steps }
    }

    pub fn max_steps(&self) -> Option<u64> {
        self.max_steps
    }

    /// Call after every training batch, once schedulers have stepped.
    ///
    /// When the scaler reports a skipped update, each scheduler is moved back
    /// two steps and stepped once, the step budget grows by one and the flag
    /// is cleared. Returns whether a skip was handled. Without schedulers
    /// this does nothing.
    pub fn on_train_batch_end(
        &mut self,
        scaler: &mut GradScaler,
        schedulers: &mut [LrScheduler],
    ) -> bool {
        if schedulers.is_empty() || scaler.optimizer_update_skipped() != Some(true) {
            return false;
        }
        for sched in schedulers.iter_mut() {
            sched.rewind(2);
            sched.step();
        }
        if let Some(max) = self.max_steps.as_mut() {
            *max += 1;
        }
        scaler.clear_skipped();
        true
    }
}

/// fp32 master copies of a stage's parameters.
pub struct MasterParams<R: Runtime<DType = DType>> {
    master: HashMap<TensorId, Tensor<R>>,
    compute_dtype: DType,
}

impl<R: Runtime<DType = DType>> MasterParams<R> {
    /// Cast every parameter to fp32. Keys stay the stage's parameter ids.
    pub fn new<C>(
        client: &C,
        params: &HashMap<TensorId, Tensor<R>>,
        compute_dtype: DType,
    ) -> Result<Self>
    where
        C: RuntimeClient<R> + TypeConversionOps<R>,
    {
        let mut master = HashMap::with_capacity(params.len());
        for (&id, param) in params {
            master.insert(id, to_dtype(client, param, DType::F32)?);
        }
        Ok(Self {
            master,
            compute_dtype,
        })
    }

    pub fn master(&self) -> &HashMap<TensorId, Tensor<R>> {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut HashMap<TensorId, Tensor<R>> {
        &mut self.master
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    /// fp32 copies of `grads` for parameters this instance tracks.
    pub fn master_grads<C>(&self, client: &C, grads: GradStore<R>) -> Result<GradStore<R>>
    where
        C: RuntimeClient<R> + TypeConversionOps<R>,
    {
        let mut out = GradStore::new();
        let ids: Vec<TensorId> = grads.keys().copied().collect();
        for id in ids {
            if !self.master.contains_key(&id) {
                return Err(Error::TrainingError {
                    reason: format!("gradient for tensor {id:?} has no master parameter"),
                });
            }
            if let Some(grad) = grads.get(id) {
                out.insert(id, to_dtype(client, grad, DType::F32)?);
            }
        }
        Ok(out)
    }

    /// Overwrite the stage's parameters with the masters cast to the compute dtype.
    pub fn write_back<C>(
        &self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + TypeConversionOps<R>,
    {
        for (&id, master) in &self.master {
            params.insert(id, to_dtype(client, master, self.compute_dtype)?);
        }
        Ok(())
    }
}

fn to_dtype<R, C>(client: &C, t: &Tensor<R>, dtype: DType) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TypeConversionOps<R>,
{
    if t.dtype() == dtype {
        Ok(t.clone())
    } else {
        Ok(client.cast(t, dtype)?)
    }
}
