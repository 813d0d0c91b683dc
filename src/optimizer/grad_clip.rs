//! Gradient clipping by global norm across model-parallel ranks.
//!
//! Each rank sums the squares of the gradients it owns; the partial sums are
//! all-reduced over the tensor- and pipeline-parallel groups so every rank
//! sees the norm of the whole model. Parameters that exist on several ranks
//! are counted once: tied copies (`shared`) are skipped everywhere and
//! replicated (non tensor-parallel) parameters count on tensor rank 0 only.

use crate::distributed::Topology;
use crate::error::{Error, Result};
use crate::model::ParamMeta;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Global-norm clipping threshold from the training config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradClip {
    pub max_norm: f64,
}

impl GradClip {
    /// `None` when clipping is disabled (unset or a non-positive value).
    pub fn from_config(gradient_clip_val: Option<f64>) -> Option<Self> {
        gradient_clip_val
            .filter(|v| *v > 0.0)
            .map(|max_norm| Self { max_norm })
    }

    pub fn clip<R, C>(
        &self,
        client: &C,
        grads: &mut GradStore<R>,
        params: &[ParamMeta],
        topology: &Topology<R>,
        device: &R::Device,
    ) -> Result<f64>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + ReduceOps<R> + ScalarOps<R> + BinaryOps<R> + TypeConversionOps<R>,
    {
        clip_grad_norm(client, grads, params, self.max_norm, topology, device)
    }
}

/// Global L2 norm of the gradients of `params`, reduced over the tensor- and
/// pipeline-parallel groups. Collective: every model-parallel rank must call it.
pub fn global_grad_norm<R, C>(
    client: &C,
    grads: &GradStore<R>,
    params: &[ParamMeta],
    topology: &Topology<R>,
    device: &R::Device,
) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ReduceOps<R> + BinaryOps<R> + TypeConversionOps<R>,
{
    let mut local_sq = 0.0f64;
    for p in params {
        if !p.requires_grad || p.shared {
            continue;
        }
        if !p.tensor_parallel && topology.tensor_parallel_rank != 0 {
            continue;
        }
        let Some(grad) = grads.get(p.id) else {
            continue;
        };
        // squares of half-precision gradients overflow their own dtype
        let flat = client.cast(&grad.contiguous().reshape(&[grad.numel()])?, DType::F64)?;
        let sq = client.mul(&flat, &flat)?;
        let sum = client.sum(&sq, &[0], false)?;
        local_sq += sum.to_vec::<f64>().first().copied().unwrap_or(0.0);
    }

    let mut total = Tensor::<R>::from_slice(&[local_sq], &[1], device);
    for group in [&topology.tensor_parallel, &topology.pipeline] {
        if group.world_size() > 1 {
            total = group.all_reduce(total)?;
        }
    }
    let total_sq = total.to_vec::<f64>().first().copied().unwrap_or(0.0);
    Ok(total_sq.sqrt())
}

/// Clip gradients in-place by global L2 norm.
///
/// Every gradient in `grads` is scaled so the global norm does not exceed
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm<R, C>(
    client: &C,
    grads: &mut GradStore<R>,
    params: &[ParamMeta],
    max_norm: f64,
    topology: &Topology<R>,
    device: &R::Device,
) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ReduceOps<R> + ScalarOps<R> + BinaryOps<R> + TypeConversionOps<R>,
{
    if max_norm <= 0.0 {
        return Err(Error::TrainingError {
            reason: format!("max_norm must be positive, got {max_norm}"),
        });
    }

    let total_norm = global_grad_norm(client, grads, params, topology, device)?;

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        let ids: Vec<_> = grads.keys().copied().collect();
        for id in ids {
            if let Some(grad) = grads.get(id) {
                let clipped = client.mul_scalar(grad, scale)?;
                grads.insert(id, clipped);
            }
        }
    }

    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::TensorId;

    fn single_rank() -> Topology<CpuRuntime> {
        let (_client, device) = cpu_setup();
        Topology::local_grid(1, 1, 1, &device).unwrap().remove(0)
    }

    #[test]
    fn test_from_config() {
        assert_eq!(GradClip::from_config(None), None);
        assert_eq!(GradClip::from_config(Some(0.0)), None);
        assert_eq!(GradClip::from_config(Some(-1.0)), None);
        assert_eq!(
            GradClip::from_config(Some(1.0)),
            Some(GradClip { max_norm: 1.0 })
        );
    }

    #[test]
    fn test_clip_no_op_when_under_max() {
        let (client, device) = cpu_setup();
        let topo = single_rank();

        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(id, Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0], &[2], &device));
        let params = vec![ParamMeta::new("w", id)];

        let norm = clip_grad_norm(&client, &mut grads, &params, 5.0, &topo, &device).unwrap();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(grads.get(id).unwrap().to_vec::<f32>(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_clip_multi_param_global_norm() {
        let (client, device) = cpu_setup();
        let topo = single_rank();

        let id1 = TensorId::new();
        let id2 = TensorId::new();
        // grad1 = [3, 0], grad2 = [0, 4] → global norm = 5.0
        let mut grads = GradStore::new();
        grads.insert(id1, Tensor::<CpuRuntime>::from_slice(&[3.0f32, 0.0], &[2], &device));
        grads.insert(id2, Tensor::<CpuRuntime>::from_slice(&[0.0f32, 4.0], &[2], &device));
        let params = vec![ParamMeta::new("a", id1), ParamMeta::new("b", id2)];

        let norm = GradClip { max_norm: 2.5 }
            .clip(&client, &mut grads, &params, &topo, &device)
            .unwrap();
        assert!((norm - 5.0).abs() < 1e-4);

        let d1 = grads.get(id1).unwrap().to_vec::<f32>();
        let d2 = grads.get(id2).unwrap().to_vec::<f32>();
        assert!((d1[0] - 1.5).abs() < 1e-4);
        assert!((d2[1] - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_shared_params_excluded_from_norm() {
        let (client, device) = cpu_setup();
        let topo = single_rank();

        let own = TensorId::new();
        let tied = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(own, Tensor::<CpuRuntime>::from_slice(&[3.0f32, 4.0], &[2], &device));
        grads.insert(tied, Tensor::<CpuRuntime>::from_slice(&[100.0f32], &[1], &device));
        let params = vec![
            ParamMeta::new("decoder.w", own),
            ParamMeta::new("word_embeddings.weight", tied).shared(),
        ];

        let norm = global_grad_norm(&client, &grads, &params, &topo, &device).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_norm_spans_pipeline_stages() {
        let (_client, device) = cpu_setup();
        let topos = Topology::<CpuRuntime>::local_grid(1, 1, 2, &device).unwrap();
        let handles: Vec<_> = topos
            .into_iter()
            .map(|topo| {
                std::thread::spawn(move || {
                    let (client, device) = cpu_setup();
                    let id = TensorId::new();
                    let value = if topo.pipeline_rank == 0 { 3.0f32 } else { 4.0 };
                    let mut grads = GradStore::new();
                    grads.insert(id, Tensor::<CpuRuntime>::from_slice(&[value], &[1], &device));
                    let params = vec![ParamMeta::new("w", id)];
                    global_grad_norm(&client, &grads, &params, &topo, &device).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!((h.join().unwrap() - 5.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_norm_squares_in_f64() {
        let (client, device) = cpu_setup();
        let topo = single_rank();

        // 1e20^2 overflows f32 but the norm itself is representable
        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(id, Tensor::<CpuRuntime>::from_slice(&[1e20f32, 0.0], &[2], &device));
        let params = vec![ParamMeta::new("w", id)];

        let norm = clip_grad_norm(&client, &mut grads, &params, 1.0, &topo, &device).unwrap();
        assert!(norm.is_finite());
        assert!((norm / 1e20 - 1.0).abs() < 1e-6);

        let clipped = grads.get(id).unwrap().to_vec::<f32>();
        assert!((clipped[0] - 1.0).abs() < 1e-4);
        assert_eq!(clipped[1], 0.0);
    }

    #[test]
    fn test_clip_rejects_non_positive_max_norm() {
        let (client, device) = cpu_setup();
        let topo = single_rank();
        let mut grads = GradStore::<CpuRuntime>::new();

        assert!(clip_grad_norm(&client, &mut grads, &[], 0.0, &topo, &device).is_err());
        let norm = clip_grad_norm(&client, &mut grads, &[], 1.0, &topo, &device).unwrap();
        assert_eq!(norm, 0.0);
    }
}
