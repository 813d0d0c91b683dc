//! The model partition a pipeline stage runs, as seen by the scheduler.
//!
//! - [`PipelineStageModel`]: forward/backward over one microbatch plus the
//!   parameter surface the step runner needs.
//! - [`ActivationStash`]: per-microbatch storage implementations use to
//!   keep whatever a later `backward` needs.

use std::collections::HashMap;

use crate::data::MicroBatch;
use crate::error::{Error, Result};
use crate::model::ParamMeta;
use numr::autograd::GradStore;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// One rank's slice of the encoder-decoder model.
///
/// The scheduler calls `forward` once per microbatch and, unless running
/// forward-only, `backward` once per microbatch in the order dictated by the
/// pipeline clock. Backward for microbatch `k` always follows forward `k`.
pub trait PipelineStageModel<R: Runtime>: Send {
    /// Owns the embedding and consumes tokens from the batch.
    fn pre_process(&self) -> bool;

    /// Owns the output head and produces per-token losses.
    fn post_process(&self) -> bool;

    /// Forward pass for one microbatch.
    ///
    /// `inputs` are the activations received from the previous stage (empty
    /// on the first stage). On the terminal stage the single returned tensor
    /// is the per-token loss; elsewhere the returned tensors are sent to the
    /// next stage.
    fn forward(
        &mut self,
        micro_batch_id: usize,
        batch: &MicroBatch<R>,
        inputs: Vec<Tensor<R>>,
    ) -> Result<Vec<Tensor<R>>>;

    /// Backward pass for one microbatch.
    ///
    /// `output_grads` match the tensors `forward` returned. Returns the
    /// gradients w.r.t. `inputs`, which the first stage may leave empty.
    /// Parameter gradients accumulate internally until [`take_grads`](Self::take_grads).
    fn backward(
        &mut self,
        micro_batch_id: usize,
        output_grads: Vec<Tensor<R>>,
    ) -> Result<Vec<Tensor<R>>>;

    /// Parameters in canonical order, identical on every data-parallel replica.
    fn parameters(&self) -> Vec<ParamMeta>;

    fn params(&self) -> &HashMap<TensorId, Tensor<R>>;

    fn params_mut(&mut self) -> &mut HashMap<TensorId, Tensor<R>>;

    /// Drain the gradients accumulated since the last call.
    fn take_grads(&mut self) -> GradStore<R>;

    /// The word-embedding weight tied between the first and last stage.
    fn shared_embedding(&self) -> Option<TensorId> {
        None
    }
}

/// Saved tensors per in-flight microbatch.
pub struct ActivationStash<R: Runtime> {
    saved: HashMap<usize, Vec<Tensor<R>>>,
}

impl<R: Runtime> Default for ActivationStash<R> {
    fn default() -> Self {
        Self {
            saved: HashMap::new(),
        }
    }
}

impl<R: Runtime> ActivationStash<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save tensors for a microbatch. Saving twice without a take is an error.
    pub fn save(&mut self, micro_batch_id: usize, tensors: Vec<Tensor<R>>) -> Result<()> {
        if self.saved.contains_key(&micro_batch_id) {
            return Err(Error::SchedulerError {
                reason: format!("activations for micro-batch {micro_batch_id} saved twice"),
            });
        }
        self.saved.insert(micro_batch_id, tensors);
        Ok(())
    }

    pub fn take(&mut self, micro_batch_id: usize) -> Result<Vec<Tensor<R>>> {
        self.saved
            .remove(&micro_batch_id)
            .ok_or_else(|| Error::SchedulerError {
                reason: format!("no saved activations for micro-batch {micro_batch_id}"),
            })
    }

    /// Microbatches still waiting for their backward.
    pub fn num_saved(&self) -> usize {
        self.saved.len()
    }

    pub fn clear(&mut self) {
        self.saved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_stash_save_and_take() {
        let (_client, device) = cpu_setup();
        let mut stash = ActivationStash::<CpuRuntime>::new();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device);
        stash.save(0, vec![t.clone()]).unwrap();
        stash.save(1, vec![t.clone()]).unwrap();
        assert!(stash.save(1, vec![t]).is_err());
        assert_eq!(stash.num_saved(), 2);

        assert_eq!(stash.take(0).unwrap().len(), 1);
        assert!(stash.take(0).is_err());
        stash.clear();
        assert_eq!(stash.num_saved(), 0);
    }

    #[test]
    fn test_stage_trait_object_is_send() {
        fn assert_send<T: Send + ?Sized>() {}
        assert_send::<dyn PipelineStageModel<CpuRuntime>>();
    }
}
