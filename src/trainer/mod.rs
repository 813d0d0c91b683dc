pub mod amp;
pub mod config;
pub mod loss;
pub mod step;

pub use amp::{MasterParams, MixedPrecisionCoordinator};
pub use config::{LossScaleConfig, Precision, StepMetrics, TrainingConfig};
pub use loss::{
    AVG_KEY, LossFn, LossOutput, LossReductionRecord, broadcast_from_last_rank, masked_token_loss,
    reduce_train_loss, reduce_validation_loss, validation_epoch_average,
};
pub use step::PipelineTrainer;
