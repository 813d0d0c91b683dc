//! Distributed training: process groups, topology, gradient synchronization
//! and pipeline scheduling.

pub mod comm_utils;
pub mod grad_sync;
pub mod group;
pub mod local;
pub mod pipeline;
pub mod tensor_parallel;
pub mod topology;

pub use grad_sync::{
    BucketEntry, GradientBuckets, all_reduce_bucketed, all_reduce_shared_embedding,
    broadcast_params,
};
pub use group::{CommGroup, ProcessGroup};
pub use local::{LocalGroup, LocalHub};
pub use tensor_parallel::{gather_along_dim, scatter_to_rank};
pub use topology::{GroupHandle, MicrobatchCalculator, Topology};
