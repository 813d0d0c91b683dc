//! Pretraining batch samplers.
//!
//! Both samplers walk the dataset in steps of `micro_batch_size *
//! data_parallel_size` samples and hand each data-parallel rank its own
//! `micro_batch_size` slice, so replicas never see the same example in a
//! step. Both resume from a `consumed_samples` count.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which sampler the data loader uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataLoaderType {
    /// Sequential order, one pass.
    #[default]
    Single,
    /// Epoch-seeded shuffle, repeats forever.
    Cyclic,
}

impl std::str::FromStr for DataLoaderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(Self::Single),
            "cyclic" => Ok(Self::Cyclic),
            other => Err(Error::ConfigError {
                reason: format!("{other} dataloader type is not supported"),
            }),
        }
    }
}

impl TryFrom<String> for DataLoaderType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DataLoaderType> for String {
    fn from(kind: DataLoaderType) -> Self {
        match kind {
            DataLoaderType::Single => "single",
            DataLoaderType::Cyclic => "cyclic",
        }
        .to_string()
    }
}

fn check_common(
    total_samples: usize,
    micro_batch_size: usize,
    data_parallel_rank: usize,
    data_parallel_size: usize,
) -> Result<()> {
    if total_samples == 0 {
        return Err(Error::DataError {
            reason: "no sample to consume: total_samples is 0".to_string(),
        });
    }
    if micro_batch_size == 0 {
        return Err(Error::ConfigError {
            reason: "micro_batch_size must be > 0".to_string(),
        });
    }
    if data_parallel_size == 0 {
        return Err(Error::ConfigError {
            reason: "data parallel size must be > 0".to_string(),
        });
    }
    if data_parallel_rank >= data_parallel_size {
        return Err(Error::ConfigError {
            reason: format!(
                "data parallel rank {data_parallel_rank} must be smaller than data parallel size {data_parallel_size}"
            ),
        });
    }
    Ok(())
}

/// Sequential sampler: samples `consumed_samples..total_samples` in order.
#[derive(Debug, Clone)]
pub struct MegatronPretrainingSampler {
    next: usize,
    total_samples: usize,
    micro_batch_size: usize,
    data_parallel_rank: usize,
    data_parallel_size: usize,
    drop_last: bool,
}

impl MegatronPretrainingSampler {
    pub fn new(
        total_samples: usize,
        consumed_samples: usize,
        micro_batch_size: usize,
        data_parallel_rank: usize,
        data_parallel_size: usize,
    ) -> Result<Self> {
        check_common(total_samples, micro_batch_size, data_parallel_rank, data_parallel_size)?;
        if consumed_samples >= total_samples {
            return Err(Error::DataError {
                reason: format!("no samples left to consume: {consumed_samples}, {total_samples}"),
            });
        }
        Ok(Self {
            next: consumed_samples,
            total_samples,
            micro_batch_size,
            data_parallel_rank,
            data_parallel_size,
            drop_last: true,
        })
    }

    /// Also yield the trailing partial global batch.
    pub fn keep_last(mut self) -> Self {
        self.drop_last = false;
        self
    }
}

impl Iterator for MegatronPretrainingSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let global = self.micro_batch_size * self.data_parallel_size;
        let remaining = self.total_samples.saturating_sub(self.next);
        if remaining == 0 || (remaining < global && self.drop_last) {
            return None;
        }
        let take = remaining.min(global);
        let batch_start = self.next;
        self.next += take;

        let start = (batch_start + self.data_parallel_rank * self.micro_batch_size).min(batch_start + take);
        let end = (start + self.micro_batch_size).min(batch_start + take);
        Some((start..end).collect())
    }
}

/// Shuffled sampler. Each data-parallel rank owns a contiguous bucket of
/// the dataset and permutes it with a seed equal to the epoch number.
#[derive(Debug, Clone)]
pub struct MegatronPretrainingRandomSampler {
    total_samples: usize,
    consumed_samples: usize,
    micro_batch_size: usize,
    data_parallel_rank: usize,
    data_parallel_size: usize,
    last_batch_size: usize,
    epoch_order: Vec<usize>,
    cursor: usize,
    epoch: Option<usize>,
}

impl MegatronPretrainingRandomSampler {
    pub fn new(
        total_samples: usize,
        consumed_samples: usize,
        micro_batch_size: usize,
        data_parallel_rank: usize,
        data_parallel_size: usize,
    ) -> Result<Self> {
        check_common(total_samples, micro_batch_size, data_parallel_rank, data_parallel_size)?;
        let global = micro_batch_size * data_parallel_size;
        if total_samples < global {
            return Err(Error::DataError {
                reason: format!(
                    "dataset of {total_samples} samples is smaller than one global batch of {global}"
                ),
            });
        }
        Ok(Self {
            total_samples,
            consumed_samples,
            micro_batch_size,
            data_parallel_rank,
            data_parallel_size,
            last_batch_size: total_samples % global,
            epoch_order: Vec::new(),
            cursor: 0,
            epoch: None,
        })
    }

    pub fn consumed_samples(&self) -> usize {
        self.consumed_samples
    }

    /// Build this rank's permutation for the epoch `consumed_samples` falls in.
    fn start_epoch(&mut self) -> Result<()> {
        let global = self.micro_batch_size * self.data_parallel_size;
        let active_total = self.total_samples - self.last_batch_size;
        let epoch = self.consumed_samples / active_total;
        let current_epoch_samples = self.consumed_samples % active_total;
        if current_epoch_samples % global != 0 {
            return Err(Error::DataError {
                reason: format!(
                    "consumed samples {} do not land on a global batch boundary of {global}",
                    self.consumed_samples
                ),
            });
        }

        let bucket_size = (self.total_samples / global) * self.micro_batch_size;
        let bucket_offset = current_epoch_samples / self.data_parallel_size;
        let start = self.data_parallel_rank * bucket_size;

        self.epoch_order = epoch_permutation(bucket_size, epoch as u64)
            .into_iter()
            .skip(bucket_offset)
            .map(|i| start + i)
            .collect();
        self.cursor = 0;
        self.epoch = Some(epoch);
        tracing::debug!(epoch, bucket_size, bucket_offset, "random sampler epoch start");
        Ok(())
    }
}

impl Iterator for MegatronPretrainingRandomSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.epoch.is_none() || self.cursor + self.micro_batch_size > self.epoch_order.len() {
            if let Err(e) = self.start_epoch() {
                tracing::error!(error = %e, "random sampler cannot continue");
                return None;
            }
            if self.epoch_order.len() < self.micro_batch_size {
                return None;
            }
        }
        let batch = self.epoch_order[self.cursor..self.cursor + self.micro_batch_size].to_vec();
        self.cursor += self.micro_batch_size;
        self.consumed_samples += self.micro_batch_size * self.data_parallel_size;
        Some(batch)
    }
}

/// Order of one data-parallel bucket in `epoch`.
///
/// Seeded by the epoch alone, so every rank draws the same permutation and
/// a resumed run reproduces the order it left off in.
fn epoch_permutation(bucket_size: usize, epoch: u64) -> Vec<usize> {
    let mut rng = SplitMix64(epoch);
    let mut order: Vec<usize> = (0..bucket_size).collect();
    for i in (1..bucket_size).rev() {
        order.swap(i, rng.below(i + 1));
    }
    order
}

struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform-ish index in `0..n`.
    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// Either sampler, selected by [`DataLoaderType`].
#[derive(Debug, Clone)]
pub enum PretrainingSampler {
    Sequential(MegatronPretrainingSampler),
    Random(MegatronPretrainingRandomSampler),
}

impl Iterator for PretrainingSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        match self {
            Self::Sequential(s) => s.next(),
            Self::Random(s) => s.next(),
        }
    }
}

pub fn build_sampler(
    kind: DataLoaderType,
    total_samples: usize,
    consumed_samples: usize,
    micro_batch_size: usize,
    data_parallel_rank: usize,
    data_parallel_size: usize,
) -> Result<PretrainingSampler> {
    Ok(match kind {
        DataLoaderType::Single => PretrainingSampler::Sequential(MegatronPretrainingSampler::new(
            total_samples,
            consumed_samples,
            micro_batch_size,
            data_parallel_rank,
            data_parallel_size,
        )?),
        DataLoaderType::Cyclic => PretrainingSampler::Random(MegatronPretrainingRandomSampler::new(
            total_samples,
            consumed_samples,
            micro_batch_size,
            data_parallel_rank,
            data_parallel_size,
        )?),
    })
}
