//! Consumed-sample bookkeeping for resumable pretraining.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static CONSUMED_SAMPLES: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"consumed_samples=([0-9]+.[0-9]+)").ok());

/// Samples seen by all replicas after `global_step` optimizer steps.
pub fn compute_consumed_samples(
    global_step: u64,
    data_parallel_size: usize,
    micro_batch_size: usize,
    num_microbatches: usize,
) -> u64 {
    global_step * (data_parallel_size * micro_batch_size * num_microbatches) as u64
}

/// Recover the consumed-sample count from a checkpoint path such as
/// `run/step=100-consumed_samples=6400.0.ckpt`.
///
/// The captured number is parsed as a float and truncated. A path without a
/// parsable count is a `ConfigError`; resuming from 0 would replay samples
/// the checkpointed run already saw.
pub fn try_parse_consumed_samples(resume_path: &str) -> Result<u64> {
    CONSUMED_SAMPLES
        .as_ref()
        .and_then(|re| re.captures(resume_path))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
        .ok_or_else(|| Error::ConfigError {
            reason: format!("cannot extract consumed samples from checkpoint path {resume_path:?}"),
        })
}

/// Lenient form of [`try_parse_consumed_samples`]: unparsable paths count
/// as 0 consumed samples.
pub fn parse_consumed_samples(resume_path: &str) -> u64 {
    try_parse_consumed_samples(resume_path).unwrap_or_else(|_| {
        tracing::warn!(
            path = resume_path,
            "cannot parse consumed samples from checkpoint path, assuming 0"
        );
        0
    })
}
