//! Explicit 3-D (data, tensor, pipeline) parallel topology.
//!
//! [`Topology`] is handed by reference to every component that needs rank or
//! group information. Groups are owned by whoever built the topology; the
//! core only issues collectives on them.
//!
//! Rank layout follows Megatron: `rank = pp_rank * (dp * tp) + dp_rank * tp + tp_rank`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::distributed::group::ProcessGroup;
use crate::distributed::local::LocalHub;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;

/// Number of microbatches per global batch for one data-parallel replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrobatchCalculator {
    pub global_batch_size: usize,
    pub micro_batch_size: usize,
    pub data_parallel_size: usize,
}

impl MicrobatchCalculator {
    pub fn new(
        global_batch_size: usize,
        micro_batch_size: usize,
        data_parallel_size: usize,
    ) -> Result<Self> {
        let per_step = micro_batch_size
            .checked_mul(data_parallel_size)
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::ConfigError {
                reason: format!(
                    "micro_batch_size ({micro_batch_size}) and data parallel size \
                     ({data_parallel_size}) must be positive"
                ),
            })?;
        if global_batch_size == 0 || global_batch_size % per_step != 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "global batch size ({global_batch_size}) is not divisible by \
                     micro batch size ({micro_batch_size}) times data parallel size \
                     ({data_parallel_size})"
                ),
            });
        }
        Ok(Self {
            global_batch_size,
            micro_batch_size,
            data_parallel_size,
        })
    }

    pub fn num_microbatches(&self) -> usize {
        self.global_batch_size / (self.micro_batch_size * self.data_parallel_size)
    }
}

/// Shared handle to a process group.
pub type GroupHandle<R> = Arc<dyn ProcessGroup<R>>;

/// Rank/group view of one process.
pub struct Topology<R: Runtime> {
    pub data_parallel_size: usize,
    pub tensor_parallel_size: usize,
    pub pipeline_parallel_size: usize,
    pub data_parallel_rank: usize,
    pub tensor_parallel_rank: usize,
    pub pipeline_rank: usize,
    /// First pipeline stage that belongs to the decoder. `None` means the
    /// stages are not split (pure encoder or a single stage).
    pub pipeline_split_rank: Option<usize>,
    pub num_microbatches: usize,
    pub world: GroupHandle<R>,
    pub data_parallel: GroupHandle<R>,
    pub tensor_parallel: GroupHandle<R>,
    pub pipeline: GroupHandle<R>,
    /// First and last pipeline stage only, when there is more than one stage.
    pub embedding: Option<GroupHandle<R>>,
}

impl<R: Runtime> Clone for Topology<R> {
    fn clone(&self) -> Self {
        Self {
            data_parallel: Arc::clone(&self.data_parallel),
            tensor_parallel: Arc::clone(&self.tensor_parallel),
            pipeline: Arc::clone(&self.pipeline),
            world: Arc::clone(&self.world),
            embedding: self.embedding.clone(),
            ..*self
        }
    }
}

impl<R: Runtime> Topology<R> {
    pub fn world_rank(&self) -> usize {
        self.world.rank()
    }

    pub fn world_size(&self) -> usize {
        self.world.world_size()
    }

    /// The rank that owns the canonical logged metrics.
    pub fn last_rank(&self) -> usize {
        self.world_size().saturating_sub(1)
    }

    pub fn is_first_stage(&self) -> bool {
        self.pipeline_rank == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.pipeline_rank + 1 == self.pipeline_parallel_size
    }

    /// Whether `stage` runs encoder layers only.
    pub fn is_stage_before_split(&self, stage: usize) -> bool {
        if self.pipeline_parallel_size == 1 {
            return true;
        }
        match self.pipeline_split_rank {
            Some(split) => stage < split,
            None => true,
        }
    }

    pub fn with_num_microbatches(mut self, calculator: &MicrobatchCalculator) -> Result<Self> {
        if calculator.data_parallel_size != self.data_parallel_size {
            return Err(Error::ConfigError {
                reason: format!(
                    "microbatch calculator assumes data parallel size {}, topology has {}",
                    calculator.data_parallel_size, self.data_parallel_size
                ),
            });
        }
        self.num_microbatches = calculator.num_microbatches();
        Ok(self)
    }

    pub fn with_pipeline_split_rank(mut self, split: Option<usize>) -> Result<Self> {
        if let Some(s) = split {
            if s == 0 || s >= self.pipeline_parallel_size {
                return Err(Error::ConfigError {
                    reason: format!(
                        "pipeline split rank {s} must lie in 1..{}",
                        self.pipeline_parallel_size
                    ),
                });
            }
        }
        self.pipeline_split_rank = split;
        Ok(self)
    }
}

impl<R> Topology<R>
where
    R: Runtime<DType = DType> + 'static,
    R::Device: Send + Sync,
{
    /// Build every rank's view of an in-process `dp x tp x pp` grid.
    ///
    /// Returned in global rank order; hand element `i` to the thread playing
    /// rank `i`. `num_microbatches` starts at 1.
    pub fn local_grid(dp: usize, tp: usize, pp: usize, device: &R::Device) -> Result<Vec<Self>> {
        if dp == 0 || tp == 0 || pp == 0 {
            return Err(Error::ConfigError {
                reason: format!("parallel sizes must be positive (dp={dp}, tp={tp}, pp={pp})"),
            });
        }
        let world_size = dp * tp * pp;
        let world_hub = LocalHub::new(world_size)?;

        let mut dp_hubs = HashMap::new();
        let mut tp_hubs = HashMap::new();
        let mut pp_hubs = HashMap::new();
        let mut emb_hubs = HashMap::new();

        let mut views = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let pp_rank = rank / (dp * tp);
            let dp_rank = (rank % (dp * tp)) / tp;
            let tp_rank = rank % tp;

            let dp_hub = hub_for(&mut dp_hubs, (pp_rank, tp_rank), dp)?;
            let tp_hub = hub_for(&mut tp_hubs, (pp_rank, dp_rank), tp)?;
            let pp_hub = hub_for(&mut pp_hubs, (dp_rank, tp_rank), pp)?;

            let embedding: Option<GroupHandle<R>> = if pp > 1 && (pp_rank == 0 || pp_rank == pp - 1) {
                let hub = hub_for(&mut emb_hubs, (dp_rank, tp_rank), 2)?;
                let member = if pp_rank == 0 { 0 } else { 1 };
                Some(Arc::new(hub.member::<R>(member, device.clone())?))
            } else {
                None
            };

            views.push(Topology {
                data_parallel_size: dp,
                tensor_parallel_size: tp,
                pipeline_parallel_size: pp,
                data_parallel_rank: dp_rank,
                tensor_parallel_rank: tp_rank,
                pipeline_rank: pp_rank,
                pipeline_split_rank: None,
                num_microbatches: 1,
                world: Arc::new(world_hub.member::<R>(rank, device.clone())?),
                data_parallel: Arc::new(dp_hub.member::<R>(dp_rank, device.clone())?),
                tensor_parallel: Arc::new(tp_hub.member::<R>(tp_rank, device.clone())?),
                pipeline: Arc::new(pp_hub.member::<R>(pp_rank, device.clone())?),
                embedding,
            });
        }
        Ok(views)
    }
}

fn hub_for(
    hubs: &mut HashMap<(usize, usize), Arc<LocalHub>>,
    key: (usize, usize),
    size: usize,
) -> Result<Arc<LocalHub>> {
    if let Some(hub) = hubs.get(&key) {
        return Ok(Arc::clone(hub));
    }
    let hub = LocalHub::new(size)?;
    hubs.insert(key, Arc::clone(&hub));
    Ok(hub)
}
