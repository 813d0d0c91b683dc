//! The update rule the step runner applies once gradients are final.

use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::HashMap;

/// An optimizer over one stage's parameters (or their fp32 masters).
///
/// By the time `step` runs, gradients have been averaged over data-parallel
/// replicas, unscaled and clipped. The learning rate is owned by the LR
/// scheduler and pushed in through `set_lr` after every step.
pub trait Optimizer<R: Runtime<DType = DType>> {
    /// Update every parameter that has a gradient; the rest stay untouched.
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + ScalarOps<R>;

    fn set_lr(&mut self, lr: f64);

    fn lr(&self) -> f64;

    /// Drop per-parameter state such as momentum buffers.
    fn reset_state(&mut self);
}
