//! SGD optimizer with momentum
//!
//! Stochastic gradient descent with optional momentum and decoupled
//! per-group weight decay, following PyTorch's SGD update rules.

use crate::error::{Error, Result};
use crate::optimizer::param_groups::ParamGroups;
use crate::optimizer::traits::Optimizer;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// SGD configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub dampening: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
            dampening: 0.0,
            nesterov: false,
        }
    }
}

impl SgdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lr.is_nan() || self.lr < 0.0 {
            return Err(Error::ConfigError {
                reason: format!("optim.lr must be non-negative, got {}", self.lr),
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::ConfigError {
                reason: format!("optim.momentum must be in [0, 1), got {}", self.momentum),
            });
        }
        if self.nesterov && (self.momentum == 0.0 || self.dampening != 0.0) {
            return Err(Error::ConfigError {
                reason: "nesterov momentum requires momentum > 0 and zero dampening".to_string(),
            });
        }
        Ok(())
    }
}

/// SGD optimizer with optional momentum
///
/// Update rules:
/// - L2 weight decay (decaying params only): `grad = grad + weight_decay * param`
/// - Momentum: `buf = momentum * buf + (1 - dampening) * grad`, `buf = grad` on the first step
/// - Nesterov: `update = grad + momentum * buf`
/// - Standard: `update = buf`
/// - Parameter: `param = param - lr * update`
pub struct Sgd<R: Runtime> {
    config: SgdConfig,
    velocity: HashMap<TensorId, Tensor<R>>,
    no_decay: HashSet<TensorId>,
}

impl<R: Runtime<DType = DType>> Sgd<R> {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
            no_decay: HashSet::new(),
        }
    }

    /// Exempt the no-decay group from weight decay.
    pub fn with_param_groups(mut self, groups: &ParamGroups) -> Self {
        self.no_decay = groups.no_decay.iter().copied().collect();
        self
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    fn weight_decay_for(&self, id: TensorId) -> f64 {
        if self.no_decay.contains(&id) {
            0.0
        } else {
            self.config.weight_decay
        }
    }
}

impl<R: Runtime<DType = DType>> Optimizer<R> for Sgd<R> {
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + ScalarOps<R>,
    {
        let SgdConfig {
            lr,
            momentum,
            dampening,
            nesterov,
            ..
        } = self.config;

        let param_ids: Vec<TensorId> = params.keys().copied().collect();

        for id in param_ids {
            let (Some(grad), Some(param)) = (grads.get(id), params.get(&id)) else {
                continue;
            };

            let wd = self.weight_decay_for(id);
            let grad = if wd > 0.0 {
                client.add(grad, &client.mul_scalar(param, wd)?)?
            } else {
                grad.clone()
            };

            let update = if momentum > 0.0 {
                let buf = match self.velocity.get(&id) {
                    Some(prev) => client.add(
                        &client.mul_scalar(prev, momentum)?,
                        &client.mul_scalar(&grad, 1.0 - dampening)?,
                    )?,
                    None => grad.clone(),
                };
                let update = if nesterov {
                    client.add(&grad, &client.mul_scalar(&buf, momentum)?)?
                } else {
                    buf.clone()
                };
                self.velocity.insert(id, buf);
                update
            } else {
                grad
            };

            let new_param = client.sub(param, &client.mul_scalar(&update, lr)?)?;
            params.insert(id, new_param);
        }

        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn reset_state(&mut self) {
        self.velocity.clear();
    }
}
