//! Micro-batch ordering for pipeline stages.
//!
//! [`PipelineClock`] lists, for one stage, the forwards and backwards it runs
//! in a step. Backward `k` always comes after forward `k`, and both kinds run
//! in increasing microbatch order.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    Forward(usize),
    Backward(usize),
}

/// Forward/backward counts of the three 1F1B phases for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub warmup: usize,
    pub steady: usize,
    pub cooldown: usize,
}

/// Action order for one stage over one step's microbatches.
#[derive(Debug, Clone, Copy)]
pub struct PipelineClock {
    num_stages: usize,
    num_micro_batches: usize,
    stage: usize,
}

impl PipelineClock {
    pub fn new(num_stages: usize, num_micro_batches: usize, stage: usize) -> Self {
        Self {
            num_stages,
            num_micro_batches,
            stage,
        }
    }

    /// Stage `k` of `P` runs `min(P - k - 1, M)` forwards before its first
    /// backward, alternates for the remaining forwards, then drains the
    /// outstanding backwards.
    pub fn phases(&self) -> Phases {
        let warmup = self
            .num_stages
            .saturating_sub(self.stage + 1)
            .min(self.num_micro_batches);
        let steady = self.num_micro_batches - warmup;
        Phases {
            warmup,
            steady,
            cooldown: warmup,
        }
    }

    /// One-forward-one-backward order.
    ///
    /// ```text
    /// Stage 0: F0 F1 F2 F3 B0 B1 B2 B3
    /// Stage 1:    F0 F1 F2 B0 F3 B1 B2 B3
    /// Stage 2:       F0 F1 B0 F2 B1 F3 B2 B3
    /// Stage 3:          F0 B0 F1 B1 F2 B2 F3 B3
    /// ```
    ///
    /// With one stage this is `F0 B0 F1 B1 ..`, the no-pipelining order.
    pub fn schedule_1f1b(&self) -> Vec<PipelineAction> {
        let Phases { warmup, steady, .. } = self.phases();

        let warm = (0..warmup).map(PipelineAction::Forward);
        let alternate = (0..steady).flat_map(|i| {
            [
                PipelineAction::Forward(warmup + i),
                PipelineAction::Backward(i),
            ]
        });
        let drain = (steady..self.num_micro_batches).map(PipelineAction::Backward);
        warm.chain(alternate).chain(drain).collect()
    }

    /// Forward passes only, in micro-batch order (evaluation).
    pub fn schedule_forward_only(&self) -> Vec<PipelineAction> {
        (0..self.num_micro_batches)
            .map(PipelineAction::Forward)
            .collect()
    }
}
