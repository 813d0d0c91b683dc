//! # seqpipe
//!
//! **Pipeline-parallel training and greedy decoding for encoder-decoder models on numr.**
//!
//! seqpipe drives one rank of a (data, tensor, pipeline) parallel grid. The
//! model itself stays outside: a stage plugs in through
//! [`PipelineStageModel`](distributed::pipeline::PipelineStageModel) and a
//! decoder through [`Seq2SeqModel`](inference::Seq2SeqModel).
//!
//! ```text
//! micro-batches ──► assemble ──► 1F1B / no-pipelining schedule ──► loss records
//!                                        │
//!                                        ▼
//!                 bucketed DP all-reduce + shared-embedding all-reduce
//!                                        │
//!                                        ▼
//!                unscale / agree overflow / clip ──► optimizer ──► LR + AMP bookkeeping
//! ```
//!
//! ## Modules
//!
//! - [`data`]: micro-batch records, global-batch assembly, samplers, consumed samples
//! - [`distributed`]: process groups, topology, gradient sync, the pipeline scheduler
//! - [`optimizer`]: SGD, LR schedules, loss scaling, clipping, parameter groups
//! - [`trainer`]: configuration, loss reduction, mixed precision, the step runner
//! - [`inference`]: greedy decoding and prompt completion
//! - [`model`]: parameter metadata and vocabulary padding

pub mod data;
pub mod distributed;
pub mod error;
pub mod inference;
pub mod model;
pub mod optimizer;
pub mod trainer;

pub use error::{Error, Result};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
