//! Microbatch records, global-batch assembly and pretraining samplers.

pub mod batch;
pub mod consumed;
pub mod sampler;

pub use batch::{AssembledBatch, MicroBatch, assemble};
pub use consumed::{compute_consumed_samples, parse_consumed_samples, try_parse_consumed_samples};
pub use sampler::{
    DataLoaderType, MegatronPretrainingRandomSampler, MegatronPretrainingSampler,
    PretrainingSampler, build_sampler,
};
