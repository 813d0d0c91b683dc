//! Parameter metadata and client bounds shared by the training path.

use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TensorOps, TypeConversionOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::TensorId;

/// Trait alias for the client bounds a training step needs.
pub trait StepClient<R: Runtime>:
    RuntimeClient<R>
    + TensorOps<R>
    + ScalarOps<R>
    + BinaryOps<R>
    + ReduceOps<R>
    + UnaryOps<R>
    + TypeConversionOps<R>
{
}

impl<R, C> StepClient<R> for C
where
    R: Runtime,
    C: RuntimeClient<R>
        + TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + ReduceOps<R>
        + UnaryOps<R>
        + TypeConversionOps<R>,
{
}

/// Description of one parameter owned by a pipeline stage.
///
/// Stages report parameters in a canonical order that is identical on every
/// data-parallel replica; gradient buckets are laid out in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamMeta {
    /// Hierarchical name, e.g. `encoder.layers.0.mlp.dense_h_to_4h.weight`.
    pub name: String,
    pub id: TensorId,
    pub requires_grad: bool,
    /// A copy of a weight owned by another stage (the tied output embedding
    /// on the last stage). Excluded from the global grad norm.
    pub shared: bool,
    /// Sharded across tensor-parallel ranks. Replicated parameters count
    /// toward the grad norm on tensor-parallel rank 0 only.
    pub tensor_parallel: bool,
}

impl ParamMeta {
    pub fn new(name: impl Into<String>, id: TensorId) -> Self {
        Self {
            name: name.into(),
            id,
            requires_grad: true,
            shared: false,
            tensor_parallel: false,
        }
    }

    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn tensor_parallel(mut self) -> Self {
        self.tensor_parallel = true;
        self
    }

    /// Biases and normalization weights are exempt from weight decay.
    pub fn decays(&self) -> bool {
        let lower = self.name.to_ascii_lowercase();
        !(lower.ends_with(".bias")
            || lower == "bias"
            || lower.contains("layernorm")
            || lower.contains("layer_norm")
            || lower.contains(".norm"))
    }
}
