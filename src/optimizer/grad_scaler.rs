//! Dynamic loss scaling for FP16 mixed precision training
//!
//! FP16 has a narrower exponent range than FP32/BF16, so gradients can underflow.
//! The scaler multiplies the loss by a large factor before backward, then
//! divides gradients by that factor. If NaN/Inf is found on any model-parallel
//! rank, the optimizer step is skipped and, once `hysteresis` consecutive
//! overflows have been seen, the scale backs off.
//!
//! Not needed for BF16 (same exponent range as FP32).

use crate::distributed::ProcessGroup;
use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Result of unscaling gradients
pub enum UnscaleResult<R: Runtime> {
    /// Gradients are finite after unscaling
    Ok(GradStore<R>),
    /// NaN/Inf detected locally
    Overflow,
}

/// Dynamic loss scaler for FP16 training
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    hysteresis: u32,
    min_scale: f64,
    consecutive_ok: u64,
    hysteresis_left: u32,
    optimizer_update_skipped: Option<bool>,
}

impl GradScaler {
    /// Create a new GradScaler with dynamic scaling parameters.
    ///
    /// # Arguments
    /// * `initial_scale` - Starting loss scale (e.g., 2^32)
    /// * `growth_factor` - Multiply scale by this after `growth_interval` clean steps (e.g., 2.0)
    /// * `backoff_factor` - Multiply scale by this on overflow (e.g., 0.5)
    /// * `growth_interval` - Number of consecutive clean steps before growing scale
    pub fn new(
        initial_scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: u64,
    ) -> Result<Self> {
        if initial_scale <= 0.0 {
            return Err(Error::TrainingError {
                reason: format!("initial_scale must be positive, got {initial_scale}"),
            });
        }
        if growth_factor <= 1.0 {
            return Err(Error::TrainingError {
                reason: format!("growth_factor must be > 1.0, got {growth_factor}"),
            });
        }
        if backoff_factor <= 0.0 || backoff_factor >= 1.0 {
            return Err(Error::TrainingError {
                reason: format!("backoff_factor must be in (0, 1), got {backoff_factor}"),
            });
        }
        if growth_interval == 0 {
            return Err(Error::TrainingError {
                reason: "growth_interval must be > 0".to_string(),
            });
        }

        Ok(Self {
            scale: initial_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            hysteresis: 1,
            min_scale: 1.0,
            consecutive_ok: 0,
            hysteresis_left: 1,
            optimizer_update_skipped: None,
        })
    }

    /// Defaults: scale=2^32, grow=2x, backoff=0.5x, interval=1000, hysteresis=2
    pub fn default_fp16() -> Self {
        Self {
            scale: 4_294_967_296.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 1000,
            hysteresis: 2,
            min_scale: 1.0,
            consecutive_ok: 0,
            hysteresis_left: 2,
            optimizer_update_skipped: None,
        }
    }

    /// Number of consecutive overflows tolerated before the scale backs off.
    pub fn with_hysteresis(mut self, hysteresis: u32) -> Result<Self> {
        if hysteresis == 0 {
            return Err(Error::TrainingError {
                reason: "hysteresis must be > 0".to_string(),
            });
        }
        self.hysteresis = hysteresis;
        self.hysteresis_left = hysteresis;
        Ok(self)
    }

    /// Get the current loss scale factor.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Scale a loss value before backward pass.
    pub fn scale_loss(&self, loss: f64) -> f64 {
        loss * self.scale
    }

    /// Whether the last [`update_scale`](Self::update_scale) saw an overflow.
    /// `None` until the first update and after [`clear_skipped`](Self::clear_skipped).
    pub fn optimizer_update_skipped(&self) -> Option<bool> {
        self.optimizer_update_skipped
    }

    pub fn clear_skipped(&mut self) {
        self.optimizer_update_skipped = None;
    }

    /// Unscale gradients and check for NaN/Inf.
    ///
    /// Divides all gradients by the current scale factor. If any gradient
    /// contains NaN or Inf after unscaling, returns `Overflow`.
    pub fn unscale_grads<R, C>(&self, client: &C, grads: GradStore<R>) -> Result<UnscaleResult<R>>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + ScalarOps<R> + UnaryOps<R> + ReduceOps<R>,
    {
        let inv_scale = 1.0 / self.scale;
        let ids: Vec<TensorId> = grads.keys().copied().collect();
        let mut unscaled = GradStore::new();

        for id in ids {
            let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
                reason: format!("missing gradient for tensor {id:?}"),
            })?;
            let g = client.mul_scalar(grad, inv_scale)?;

            if has_nan_inf(client, &g)? {
                return Ok(UnscaleResult::Overflow);
            }

            unscaled.insert(id, g);
        }

        Ok(UnscaleResult::Ok(unscaled))
    }

    /// Update the scale factor after an optimizer step (or skipped step).
    ///
    /// `overflow` must be the value agreed across model-parallel ranks, see
    /// [`agree_overflow`].
    pub fn update_scale(&mut self, overflow: bool) {
        self.optimizer_update_skipped = Some(overflow);
        if overflow {
            self.consecutive_ok = 0;
            self.hysteresis_left = self.hysteresis_left.saturating_sub(1);
            if self.hysteresis_left == 0 {
                self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            }
        } else {
            self.consecutive_ok += 1;
            if self.consecutive_ok >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.consecutive_ok = 0;
                self.hysteresis_left = self.hysteresis;
            }
        }
    }
}

/// Check if a tensor contains NaN or Inf values on-device.
pub fn has_nan_inf<R, C>(client: &C, tensor: &Tensor<R>) -> Result<bool>
where
    R: Runtime<DType = DType>,
    C: UnaryOps<R> + ReduceOps<R>,
{
    let nan_mask = client.isnan(tensor)?;
    let inf_mask = client.isinf(tensor)?;
    let has_nan = client.any(&nan_mask, &[], false)?;
    let has_inf = client.any(&inf_mask, &[], false)?;
    Ok(has_nan.item::<u8>()? != 0 || has_inf.item::<u8>()? != 0)
}

/// Combine a local overflow flag across `groups` (typically tensor- and
/// pipeline-parallel) so every model-parallel rank skips the same step.
pub fn agree_overflow<R>(
    groups: &[&dyn ProcessGroup<R>],
    found_inf: bool,
    device: &R::Device,
) -> Result<bool>
where
    R: Runtime<DType = DType>,
{
    let mut flag = Tensor::<R>::from_slice(&[f64::from(u8::from(found_inf))], &[1], device);
    for group in groups {
        if group.world_size() > 1 {
            flag = group.all_reduce(flag)?;
        }
    }
    let total = flag.to_vec::<f64>().first().copied().unwrap_or(0.0);
    Ok(total > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalHub;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_grad_scaler_default() {
        let scaler = GradScaler::default_fp16();
        assert_eq!(scaler.scale(), 4_294_967_296.0);
        assert_eq!(scaler.optimizer_update_skipped(), None);
    }

    #[test]
    fn test_scale_loss() {
        let scaler = GradScaler::new(65536.0, 2.0, 0.5, 10).unwrap();
        assert_eq!(scaler.scale_loss(0.5), 32768.0);
    }

    #[test]
    fn test_unscale_grads_ok() {
        let (client, device) = cpu_setup();
        let scaler = GradScaler::new(100.0, 2.0, 0.5, 10).unwrap();

        let id = TensorId::new();
        let grad = Tensor::<CpuRuntime>::from_slice(&[200.0f32, 400.0], &[2], &device);
        let mut grads = GradStore::new();
        grads.insert(id, grad);

        match scaler.unscale_grads(&client, grads).unwrap() {
            UnscaleResult::Ok(unscaled) => {
                let data = unscaled.get(id).unwrap().to_vec::<f32>();
                assert!((data[0] - 2.0).abs() < 1e-5);
                assert!((data[1] - 4.0).abs() < 1e-5);
            }
            UnscaleResult::Overflow => panic!("expected Ok, got Overflow"),
        }
    }

    #[test]
    fn test_unscale_grads_overflow() {
        let (client, device) = cpu_setup();
        let scaler = GradScaler::new(100.0, 2.0, 0.5, 10).unwrap();

        let id = TensorId::new();
        let grad = Tensor::<CpuRuntime>::from_slice(&[f32::NAN, 1.0], &[2], &device);
        let mut grads = GradStore::new();
        grads.insert(id, grad);

        assert!(matches!(
            scaler.unscale_grads(&client, grads).unwrap(),
            UnscaleResult::Overflow
        ));
    }

    #[test]
    fn test_update_scale_growth_and_skip_flag() {
        let mut scaler = GradScaler::new(100.0, 2.0, 0.5, 3).unwrap();
        scaler.update_scale(false);
        scaler.update_scale(false);
        assert_eq!(scaler.scale(), 100.0);
        scaler.update_scale(false);
        assert_eq!(scaler.scale(), 200.0);
        assert_eq!(scaler.optimizer_update_skipped(), Some(false));

        scaler.update_scale(true);
        assert_eq!(scaler.scale(), 100.0);
        assert_eq!(scaler.optimizer_update_skipped(), Some(true));
        scaler.clear_skipped();
        assert_eq!(scaler.optimizer_update_skipped(), None);
    }

    #[test]
    fn test_hysteresis_delays_backoff() {
        let mut scaler = GradScaler::new(64.0, 2.0, 0.5, 100)
            .unwrap()
            .with_hysteresis(2)
            .unwrap();
        scaler.update_scale(true);
        assert_eq!(scaler.scale(), 64.0);
        scaler.update_scale(true);
        assert_eq!(scaler.scale(), 32.0);
        // Tracker stays exhausted until the next growth.
        scaler.update_scale(false);
        scaler.update_scale(true);
        assert_eq!(scaler.scale(), 16.0);
    }

    #[test]
    fn test_invalid_params() {
        assert!(GradScaler::new(0.0, 2.0, 0.5, 10).is_err());
        assert!(GradScaler::new(100.0, 0.5, 0.5, 10).is_err());
        assert!(GradScaler::new(100.0, 2.0, 1.5, 10).is_err());
        assert!(GradScaler::new(100.0, 2.0, 0.5, 0).is_err());
        assert!(GradScaler::default_fp16().with_hysteresis(0).is_err());
    }

    #[test]
    fn test_agree_overflow_across_ranks() {
        let (_client, device) = cpu_setup();
        let hub = LocalHub::new(2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let group = hub.member::<CpuRuntime>(rank, device.clone()).unwrap();
                let device = device.clone();
                std::thread::spawn(move || {
                    let g: &dyn ProcessGroup<CpuRuntime> = &group;
                    agree_overflow::<CpuRuntime>(&[g], rank == 1, &device).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
