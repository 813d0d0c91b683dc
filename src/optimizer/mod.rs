pub mod grad_clip;
pub mod grad_scaler;
pub mod lr_schedule;
pub mod param_groups;
pub mod sgd;
pub mod traits;

pub use grad_clip::{GradClip, clip_grad_norm, global_grad_norm};
pub use grad_scaler::{GradScaler, UnscaleResult, agree_overflow, has_nan_inf};
pub use lr_schedule::{LrSchedule, LrScheduler};
pub use param_groups::{ParamGroups, param_groups};
pub use sgd::{Sgd, SgdConfig};
pub use traits::Optimizer;
