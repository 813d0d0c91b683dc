//! One training, validation or test step of a pipeline stage.
//!
//! Training runs, in order: batch assembly, the microbatch schedule, loss
//! reduction, data-parallel gradient averaging, the shared-embedding
//! reduction, the last-rank loss broadcast, loss unscaling with overflow
//! agreement, clipping, the optimizer update, LR scheduling and the
//! mixed-precision bookkeeping. Every rank of the world must call the same
//! step methods in the same order; all of them issue collectives.

use crate::data::{AssembledBatch, MicroBatch, assemble, compute_consumed_samples, try_parse_consumed_samples};
use crate::distributed::pipeline::{PipelineStageModel, ScheduleArgs, ScheduleStrategy, StepShapes};
use crate::distributed::{
    ProcessGroup, Topology, all_reduce_bucketed, all_reduce_shared_embedding, broadcast_params,
};
use crate::error::{Error, Result};
use crate::model::StepClient;
use crate::optimizer::{
    GradClip, GradScaler, LrScheduler, Optimizer, UnscaleResult, agree_overflow,
};
use crate::trainer::amp::{MasterParams, MixedPrecisionCoordinator};
use crate::trainer::config::{StepMetrics, TrainingConfig};
use crate::trainer::loss::{
    LossFn, broadcast_from_last_rank, reduce_train_loss, reduce_validation_loss,
    validation_epoch_average,
};
use numr::dtype::DType;
use numr::runtime::Runtime;

/// Drives one rank's stage through training and evaluation steps.
pub struct PipelineTrainer<R: Runtime<DType = DType>, O: Optimizer<R>> {
    config: TrainingConfig,
    topology: Topology<R>,
    device: R::Device,
    strategy: ScheduleStrategy,
    optimizer: O,
    schedulers: Vec<LrScheduler>,
    scaler: Option<GradScaler>,
    clip: Option<GradClip>,
    coordinator: MixedPrecisionCoordinator,
    master: Option<MasterParams<R>>,
    global_step: u64,
    init_consumed_samples: u64,
    validation_losses: Vec<f64>,
    validation_steps: usize,
    test_losses: Vec<f64>,
    test_steps: usize,
}

impl<R, O> PipelineTrainer<R, O>
where
    R: Runtime<DType = DType>,
    O: Optimizer<R>,
{
    /// Set up the step runner for `stage`.
    ///
    /// Checks the topology against the config, broadcasts the stage's
    /// parameters from data-parallel rank 0 and, on the O2 path, creates the
    /// fp32 masters. Collective over the data-parallel group.
    pub fn new<C>(
        client: &C,
        config: TrainingConfig,
        topology: Topology<R>,
        device: R::Device,
        optimizer: O,
        stage: &mut dyn PipelineStageModel<R>,
    ) -> Result<Self>
    where
        C: StepClient<R>,
    {
        config.validate()?;
        if topology.tensor_parallel_size != config.tensor_model_parallel_size
            || topology.pipeline_parallel_size != config.pipeline_model_parallel_size
        {
            return Err(Error::ConfigError {
                reason: format!(
                    "topology tp={} pp={} does not match config tp={} pp={}",
                    topology.tensor_parallel_size,
                    topology.pipeline_parallel_size,
                    config.tensor_model_parallel_size,
                    config.pipeline_model_parallel_size
                ),
            });
        }
        let calculator = config.microbatch_calculator(topology.data_parallel_size)?;
        let topology = topology
            .with_pipeline_split_rank(config.pipeline_model_parallel_split_rank)?
            .with_num_microbatches(&calculator)?;

        let params = stage.parameters();
        broadcast_params(topology.data_parallel.as_ref(), &params, stage.params_mut(), 0)?;

        let master = if config.megatron_amp_o2 {
            Some(MasterParams::new(
                client,
                stage.params(),
                config.precision.compute_dtype(),
            )?)
        } else {
            None
        };

        let mut optimizer = optimizer;
        let schedulers: Vec<LrScheduler> = config.sched.iter().cloned().map(LrScheduler::new).collect();
        if let Some(sched) = schedulers.first() {
            optimizer.set_lr(sched.lr());
        }

        let init_consumed_samples = match config.resume_from_checkpoint.as_deref() {
            Some(path) => try_parse_consumed_samples(path)?,
            None => 0,
        };

        Ok(Self {
            strategy: ScheduleStrategy::for_topology(&topology),
            scaler: config.grad_scaler()?,
            clip: config.grad_clip(),
            coordinator: MixedPrecisionCoordinator::new(config.max_steps),
            config,
            topology,
            device,
            optimizer,
            schedulers,
            master,
            global_step: 0,
            init_consumed_samples,
            validation_losses: Vec::new(),
            validation_steps: 0,
            test_losses: Vec::new(),
            test_steps: 0,
        })
    }

    pub fn topology(&self) -> &Topology<R> {
        &self.topology
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    pub fn master_params(&self) -> Option<&MasterParams<R>> {
        self.master.as_ref()
    }

    /// Step budget, grown by one for every skipped update.
    pub fn max_steps(&self) -> Option<u64> {
        self.coordinator.max_steps()
    }

    pub fn is_done(&self) -> bool {
        self.max_steps().is_some_and(|max| self.global_step >= max)
    }

    /// Samples consumed across all replicas, including those before a resume.
    pub fn consumed_samples(&self) -> u64 {
        self.init_consumed_samples
            + compute_consumed_samples(
                self.global_step,
                self.topology.data_parallel_size,
                self.config.micro_batch_size,
                self.topology.num_microbatches,
            )
    }

    fn assemble_step<C>(
        &self,
        client: &C,
        micro_batches: &[MicroBatch<R>],
    ) -> Result<(AssembledBatch<R>, StepShapes)>
    where
        C: StepClient<R>,
    {
        let batch = assemble(client, micro_batches)?;
        if batch.num_microbatches() != self.topology.num_microbatches {
            tracing::debug!(
                got = batch.num_microbatches(),
                expected = self.topology.num_microbatches,
                "micro-batch count differs from the configured global batch"
            );
        }
        let shapes = StepShapes::from_batch(&batch, self.config.hidden_size);
        Ok((batch, shapes))
    }

    /// One optimizer step over a global batch.
    pub fn train_step<C>(
        &mut self,
        client: &C,
        stage: &mut dyn PipelineStageModel<R>,
        micro_batches: &[MicroBatch<R>],
        loss_fn: &LossFn<'_, R>,
    ) -> Result<StepMetrics>
    where
        C: StepClient<R>,
    {
        let (batch, shapes) = self.assemble_step(client, micro_batches)?;
        let args = ScheduleArgs {
            forward_only: false,
            shapes,
            grad_scale: self.scaler.as_ref().map_or(1.0, GradScaler::scale),
        };
        let output = self
            .strategy
            .run(client, &self.topology, stage, &batch, &args, loss_fn)?;
        let loss_mean = reduce_train_loss(client, &output.records)?;

        let params = stage.parameters();
        let mut grads = stage.take_grads();
        if let Some(master) = &self.master {
            grads = master.master_grads(client, grads)?;
        }
        all_reduce_bucketed(client, self.topology.data_parallel.as_ref(), &params, &mut grads)?;
        all_reduce_shared_embedding(
            &self.topology,
            &mut grads,
            stage.shared_embedding(),
            self.config.share_word_embeddings,
        )?;

        let reduced_train_loss = broadcast_from_last_rank(&self.topology, loss_mean, &self.device)?;

        let (grads, overflow) = match &self.scaler {
            Some(scaler) => {
                let (grads, local_overflow) = match scaler.unscale_grads(client, grads)? {
                    UnscaleResult::Ok(unscaled) => (Some(unscaled), false),
                    UnscaleResult::Overflow => (None, true),
                };
                let groups: [&dyn ProcessGroup<R>; 2] = [
                    self.topology.tensor_parallel.as_ref(),
                    self.topology.pipeline.as_ref(),
                ];
                (grads, agree_overflow(&groups, local_overflow, &self.device)?)
            }
            None => (Some(grads), false),
        };

        let mut grad_norm = None;
        match grads {
            Some(mut grads) if !overflow => {
                if let Some(clip) = self.clip {
                    grad_norm =
                        Some(clip.clip(client, &mut grads, &params, &self.topology, &self.device)?);
                }
                match self.master.as_mut() {
                    Some(master) => {
                        self.optimizer.step(client, master.master_mut(), &grads)?;
                        master.write_back(client, stage.params_mut())?;
                    }
                    None => self.optimizer.step(client, stage.params_mut(), &grads)?,
                }
            }
            _ => {
                tracing::warn!(
                    global_step = self.global_step,
                    loss_scale = ?self.scaler.as_ref().map(GradScaler::scale),
                    "gradient overflow, skipping optimizer step"
                );
            }
        }

        if let Some(scaler) = self.scaler.as_mut() {
            scaler.update_scale(overflow);
        }
        for sched in &mut self.schedulers {
            sched.step();
        }
        if let Some(scaler) = self.scaler.as_mut() {
            self.coordinator.on_train_batch_end(scaler, &mut self.schedulers);
        }
        if let Some(sched) = self.schedulers.first() {
            self.optimizer.set_lr(sched.lr());
        }

        self.global_step += 1;
        let metrics = StepMetrics {
            global_step: self.global_step,
            reduced_train_loss,
            lr: self.optimizer.lr(),
            consumed_samples: self.consumed_samples(),
            grad_norm,
            loss_scale: self.scaler.as_ref().map(GradScaler::scale),
            skipped: overflow,
        };
        if self.topology.world_rank() == 0 {
            tracing::info!(
                global_step = metrics.global_step,
                reduced_train_loss = metrics.reduced_train_loss,
                lr = metrics.lr,
                consumed_samples = metrics.consumed_samples,
                grad_norm = ?metrics.grad_norm,
                loss_scale = ?metrics.loss_scale,
                "train step"
            );
        }
        Ok(metrics)
    }

    fn eval_step<C>(
        &self,
        client: &C,
        stage: &mut dyn PipelineStageModel<R>,
        micro_batches: &[MicroBatch<R>],
        loss_fn: &LossFn<'_, R>,
    ) -> Result<Option<f64>>
    where
        C: StepClient<R>,
    {
        let (batch, shapes) = self.assemble_step(client, micro_batches)?;
        let args = ScheduleArgs {
            forward_only: true,
            shapes,
            grad_scale: 1.0,
        };
        let output = self
            .strategy
            .run(client, &self.topology, stage, &batch, &args, loss_fn)?;
        reduce_validation_loss(client, &output.records)
    }

    /// Forward-only pass over a validation batch.
    ///
    /// Returns the data-parallel averaged loss on the last stage and `None`
    /// on every other stage.
    pub fn validation_step<C>(
        &mut self,
        client: &C,
        stage: &mut dyn PipelineStageModel<R>,
        micro_batches: &[MicroBatch<R>],
        loss_fn: &LossFn<'_, R>,
    ) -> Result<Option<f64>>
    where
        C: StepClient<R>,
    {
        let loss = self.eval_step(client, stage, micro_batches, loss_fn)?;
        self.validation_steps += 1;
        self.validation_losses.extend(loss);
        Ok(loss)
    }

    /// Average the epoch's validation losses and share the last rank's value.
    ///
    /// `None` when no validation step ran since the last call.
    pub fn validation_epoch_end(&mut self) -> Result<Option<f64>> {
        let steps = std::mem::take(&mut self.validation_steps);
        let losses = std::mem::take(&mut self.validation_losses);
        let loss = self.epoch_end(steps, &losses)?;
        if let Some(val_loss) = loss
            && self.topology.world_rank() == 0
        {
            tracing::info!(val_loss, global_step = self.global_step, "validation");
        }
        Ok(loss)
    }

    /// Same as [`validation_step`](Self::validation_step) on a test batch.
    pub fn test_step<C>(
        &mut self,
        client: &C,
        stage: &mut dyn PipelineStageModel<R>,
        micro_batches: &[MicroBatch<R>],
        loss_fn: &LossFn<'_, R>,
    ) -> Result<Option<f64>>
    where
        C: StepClient<R>,
    {
        let loss = self.eval_step(client, stage, micro_batches, loss_fn)?;
        self.test_steps += 1;
        self.test_losses.extend(loss);
        Ok(loss)
    }

    pub fn test_epoch_end(&mut self) -> Result<Option<f64>> {
        let steps = std::mem::take(&mut self.test_steps);
        let losses = std::mem::take(&mut self.test_losses);
        let loss = self.epoch_end(steps, &losses)?;
        if let Some(test_loss) = loss
            && self.topology.world_rank() == 0
        {
            tracing::info!(test_loss, "test");
        }
        Ok(loss)
    }

    fn epoch_end(&self, steps: usize, losses: &[f64]) -> Result<Option<f64>> {
        if steps == 0 {
            return Ok(None);
        }
        let local = validation_epoch_average(
            self.topology.data_parallel.as_ref(),
            losses,
            &self.device,
        )?;
        let value = broadcast_from_last_rank(&self.topology, local.unwrap_or(0.0), &self.device)?;
        Ok(Some(value))
    }
}
