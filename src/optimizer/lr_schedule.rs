//! Learning rate schedules and the stateful scheduler the trainer steps.
//!
//! [`LrSchedule`] is a pure function of the step. [`LrScheduler`] holds the
//! step counter; the counter is signed so that a skipped optimizer step can
//! be undone by rewinding before the next `step()`.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning rate schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Constant learning rate
    Constant { lr: f64 },
    /// Linear warmup then constant
    LinearWarmup { base_lr: f64, warmup_steps: u64 },
    /// Cosine annealing with optional warmup
    CosineAnnealing {
        base_lr: f64,
        min_lr: f64,
        warmup_steps: u64,
        total_steps: u64,
    },
    /// Inverse square root decay (original Transformer schedule)
    ///
    /// `lr = base_lr * min(step^(-0.5), step * warmup_steps^(-1.5))`
    InverseSqrt { base_lr: f64, warmup_steps: u64 },
}

impl LrSchedule {
    /// Get the learning rate for a given step
    pub fn get_lr(&self, step: u64) -> f64 {
        match self {
            LrSchedule::Constant { lr } => *lr,

            LrSchedule::LinearWarmup {
                base_lr,
                warmup_steps,
            } => warmup(*base_lr, *warmup_steps, step),

            LrSchedule::CosineAnnealing {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
            } => {
                if step < *warmup_steps {
                    warmup(*base_lr, *warmup_steps, step)
                } else if step >= *total_steps {
                    *min_lr
                } else {
                    let decay_steps = total_steps - warmup_steps;
                    let progress = (step - warmup_steps) as f64 / decay_steps as f64;
                    min_lr + (base_lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
                }
            }

            LrSchedule::InverseSqrt {
                base_lr,
                warmup_steps,
            } => {
                if step == 0 {
                    return 0.0;
                }
                let s = step as f64;
                let w = (*warmup_steps).max(1) as f64;
                base_lr * s.powf(-0.5).min(s * w.powf(-1.5))
            }
        }
    }
}

fn warmup(base_lr: f64, warmup_steps: u64, step: u64) -> f64 {
    if warmup_steps == 0 || step >= warmup_steps {
        base_lr
    } else {
        base_lr * (step as f64 / warmup_steps as f64)
    }
}

/// A schedule plus its step counter.
///
/// Starts at step 0 with `lr = schedule.get_lr(0)`. Negative counters (after
/// a rewind past zero) evaluate the schedule at step 0.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    schedule: LrSchedule,
    last_step: i64,
    lr: f64,
}

impl LrScheduler {
    pub fn new(schedule: LrSchedule) -> Self {
        let lr = schedule.get_lr(0);
        Self {
            schedule,
            last_step: 0,
            lr,
        }
    }

    /// Advance the counter by one and recompute the learning rate.
    pub fn step(&mut self) -> f64 {
        self.last_step += 1;
        self.lr = self.schedule.get_lr(self.last_step.max(0) as u64);
        self.lr
    }

    /// Move the counter back by `n` without recomputing the learning rate.
    pub fn rewind(&mut self, n: i64) {
        self.last_step -= n;
    }

    pub fn last_step(&self) -> i64 {
        self.last_step
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }
}
