//! Drives a [`PipelineStageModel`] through one step's microbatches.
//!
//! [`ScheduleStrategy`] is picked once from the topology:
//!
//! - `NoPipelining`: one stage runs `F0 B0 F1 B1 ..` with no transfers.
//! - `Pipelined`: 1F1B across `num_stages` stages with point-to-point
//!   activation/gradient transfers between neighbours.
//!
//! In both cases the terminal stage applies the loss function right after
//! each forward and keeps the scaled output gradient for the matching
//! backward. Only the terminal stage returns loss records.

use std::collections::HashMap;

use super::clock::{PipelineAction, PipelineClock};
use super::comm::{recv_activations, send_activations};
use super::stage::PipelineStageModel;
use crate::data::AssembledBatch;
use crate::distributed::topology::Topology;
use crate::error::{Error, Result};
use crate::trainer::loss::{LossFn, LossOutput, LossReductionRecord};
use numr::dtype::DType;
use numr::ops::ScalarOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// How a step's microbatches are ordered across stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStrategy {
    NoPipelining,
    Pipelined { num_stages: usize },
}

impl ScheduleStrategy {
    pub fn for_topology<R: Runtime>(topology: &Topology<R>) -> Self {
        match topology.pipeline_parallel_size {
            0 | 1 => Self::NoPipelining,
            n => Self::Pipelined { num_stages: n },
        }
    }

    fn clock<R: Runtime>(&self, topology: &Topology<R>, num_micro_batches: usize) -> Result<PipelineClock> {
        match *self {
            Self::NoPipelining => {
                if topology.pipeline_parallel_size > 1 {
                    return Err(Error::SchedulerError {
                        reason: format!(
                            "no-pipelining schedule used with {} pipeline stages",
                            topology.pipeline_parallel_size
                        ),
                    });
                }
                Ok(PipelineClock::new(1, num_micro_batches, 0))
            }
            Self::Pipelined { num_stages } => {
                if num_stages != topology.pipeline_parallel_size {
                    return Err(Error::SchedulerError {
                        reason: format!(
                            "schedule built for {num_stages} stages, topology has {}",
                            topology.pipeline_parallel_size
                        ),
                    });
                }
                Ok(PipelineClock::new(num_stages, num_micro_batches, topology.pipeline_rank))
            }
        }
    }
}

/// Activation shape descriptor for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepShapes {
    /// `[encoder_seq_len, micro_batch_size, hidden_size]`
    pub tensor_shape: [usize; 3],
    pub decoder_seq_len: usize,
}

impl StepShapes {
    pub fn from_batch<R: Runtime>(batch: &AssembledBatch<R>, hidden_size: usize) -> Self {
        Self {
            tensor_shape: [batch.encoder_seq_len(), batch.micro_batch_size(), hidden_size],
            decoder_seq_len: batch.decoder_seq_len(),
        }
    }

    /// Shapes of the tensors `stage` sends forward.
    ///
    /// Encoder stages send the encoder hidden state; stages at or after the
    /// split send `[decoder hidden, encoder hidden]`.
    pub fn for_stage<R: Runtime>(&self, topology: &Topology<R>, stage: usize) -> Vec<[usize; 3]> {
        let [enc, mbs, hidden] = self.tensor_shape;
        if topology.is_stage_before_split(stage) {
            vec![[enc, mbs, hidden]]
        } else {
            vec![[self.decoder_seq_len, mbs, hidden], [enc, mbs, hidden]]
        }
    }
}

/// Per-step knobs for [`ScheduleStrategy::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleArgs {
    /// Skip every backward and gradient transfer.
    pub forward_only: bool,
    pub shapes: StepShapes,
    /// Loss scale applied to the terminal output gradient (1.0 without fp16).
    pub grad_scale: f64,
}

/// What one stage did during a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub forwards: usize,
    pub backwards: usize,
    pub tensors_sent: usize,
    pub tensors_received: usize,
}

pub struct ScheduleOutput<R: Runtime> {
    /// One record per microbatch on the terminal stage, empty elsewhere.
    pub records: Vec<LossReductionRecord<R>>,
    pub stats: ScheduleStats,
}

impl ScheduleStrategy {
    /// Run every microbatch of `batch` through `stage`.
    pub fn run<R, C>(
        &self,
        client: &C,
        topology: &Topology<R>,
        stage: &mut dyn PipelineStageModel<R>,
        batch: &AssembledBatch<R>,
        args: &ScheduleArgs,
        loss_fn: &LossFn<'_, R>,
    ) -> Result<ScheduleOutput<R>>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + ScalarOps<R>,
    {
        let num_micro_batches = batch.num_microbatches();
        if num_micro_batches == 0 {
            return Err(Error::SchedulerError {
                reason: "num_micro_batches must be > 0".to_string(),
            });
        }
        let clock = self.clock(topology, num_micro_batches)?;
        let is_first = topology.is_first_stage();
        let is_last = topology.is_last_stage();
        if stage.pre_process() != is_first || stage.post_process() != is_last {
            return Err(Error::SchedulerError {
                reason: format!(
                    "stage flags pre_process={} post_process={} disagree with pipeline rank {} of {}",
                    stage.pre_process(),
                    stage.post_process(),
                    topology.pipeline_rank,
                    topology.pipeline_parallel_size
                ),
            });
        }

        let rank = topology.pipeline_rank;
        let pipeline = topology.pipeline.as_ref();
        let recv_shapes = if is_first {
            Vec::new()
        } else {
            args.shapes.for_stage(topology, rank - 1)
        };
        let send_shapes = args.shapes.for_stage(topology, rank);
        let grad_factor = args.grad_scale / num_micro_batches as f64;

        let actions = if args.forward_only {
            clock.schedule_forward_only()
        } else {
            let phases = clock.phases();
            tracing::debug!(
                stage = rank,
                warmup = phases.warmup,
                steady = phases.steady,
                cooldown = phases.cooldown,
                "1F1B phases"
            );
            clock.schedule_1f1b()
        };

        let mut records = Vec::new();
        let mut pending_grads: HashMap<usize, Tensor<R>> = HashMap::new();
        let mut stats = ScheduleStats::default();

        for action in actions {
            match action {
                PipelineAction::Forward(mb_id) => {
                    let micro_batch = batch.micro_batch(mb_id)?;
                    let inputs = if is_first {
                        Vec::new()
                    } else {
                        let received = recv_activations(pipeline, rank - 1, mb_id, false, &recv_shapes)?;
                        stats.tensors_received += received.len();
                        received
                    };
                    let mut outputs = stage.forward(mb_id, &micro_batch, inputs)?;
                    stats.forwards += 1;

                    if is_last {
                        if outputs.len() != 1 {
                            return Err(Error::SchedulerError {
                                reason: format!(
                                    "terminal stage returned {} tensors for micro-batch {mb_id}, expected the per-token loss",
                                    outputs.len()
                                ),
                            });
                        }
                        let per_token = outputs.remove(0);
                        let LossOutput {
                            output_grad,
                            record,
                            ..
                        } = loss_fn(&micro_batch, &per_token)?;
                        records.push(record);
                        if !args.forward_only {
                            pending_grads.insert(mb_id, client.mul_scalar(&output_grad, grad_factor)?);
                        }
                    } else {
                        send_activations(pipeline, &outputs, rank + 1, mb_id, false)?;
                        stats.tensors_sent += outputs.len();
                    }
                }
                PipelineAction::Backward(mb_id) => {
                    let output_grads = if is_last {
                        let grad = pending_grads.remove(&mb_id).ok_or_else(|| Error::SchedulerError {
                            reason: format!("no output gradient for micro-batch {mb_id}"),
                        })?;
                        vec![grad]
                    } else {
                        let received = recv_activations(pipeline, rank + 1, mb_id, true, &send_shapes)?;
                        stats.tensors_received += received.len();
                        received
                    };
                    let input_grads = stage.backward(mb_id, output_grads)?;
                    stats.backwards += 1;

                    if !is_first {
                        if input_grads.len() != recv_shapes.len() {
                            return Err(Error::SchedulerError {
                                reason: format!(
                                    "stage {rank} returned {} input gradients for micro-batch {mb_id}, expected {}",
                                    input_grads.len(),
                                    recv_shapes.len()
                                ),
                            });
                        }
                        send_activations(pipeline, &input_grads, rank - 1, mb_id, true)?;
                        stats.tensors_sent += input_grads.len();
                    }
                }
            }
        }

        tracing::debug!(
            strategy = ?self,
            stage = rank,
            forwards = stats.forwards,
            backwards = stats.backwards,
            records = records.len(),
            "pipeline schedule finished"
        );
        Ok(ScheduleOutput { records, stats })
    }
}
