//! Training configuration and metrics
//!
//! [`TrainingConfig`] is read from YAML (every field has a default) and
//! validated once at setup; all config faults surface as
//! [`Error::ConfigError`] before any collective is issued.

use crate::data::DataLoaderType;
use crate::distributed::MicrobatchCalculator;
use crate::error::{Error, Result};
use crate::optimizer::{GradClip, GradScaler, LrSchedule, SgdConfig};
use numr::dtype::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Numeric precision of the forward/backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "PrecisionValue", into = "PrecisionValue")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum PrecisionValue {
    Bits(i64),
    Name(String),
}

impl TryFrom<PrecisionValue> for Precision {
    type Error = Error;

    fn try_from(value: PrecisionValue) -> Result<Self> {
        match value {
            PrecisionValue::Bits(32) => Ok(Self::Fp32),
            PrecisionValue::Bits(16) => Ok(Self::Fp16),
            PrecisionValue::Name(name) if name == "bf16" => Ok(Self::Bf16),
            other => Err(Error::ConfigError {
                reason: format!("precision must be one of 32, 16 or \"bf16\", got {other:?}"),
            }),
        }
    }
}

impl From<Precision> for PrecisionValue {
    fn from(p: Precision) -> Self {
        match p {
            Precision::Fp32 => Self::Bits(32),
            Precision::Fp16 => Self::Bits(16),
            Precision::Bf16 => Self::Name("bf16".to_string()),
        }
    }
}

impl Precision {
    /// Dtype the stage computes in.
    pub fn compute_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }

    /// Only fp16 needs a dynamic loss scale.
    pub fn needs_loss_scaling(self) -> bool {
        self == Precision::Fp16
    }
}

/// Dynamic loss-scale settings for fp16 runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u64,
    pub hysteresis: u32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 4_294_967_296.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 1000,
            hysteresis: 2,
        }
    }
}

impl LossScaleConfig {
    pub(crate) fn to_grad_scaler(&self) -> Result<GradScaler> {
        GradScaler::new(
            self.initial_scale,
            self.growth_factor,
            self.backoff_factor,
            self.growth_interval,
        )?
        .with_hysteresis(self.hysteresis)
    }
}

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub micro_batch_size: usize,
    pub global_batch_size: usize,
    pub tensor_model_parallel_size: usize,
    pub pipeline_model_parallel_size: usize,
    /// First pipeline stage that runs decoder layers.
    pub pipeline_model_parallel_split_rank: Option<usize>,
    pub hidden_size: usize,
    pub encoder_seq_length: usize,
    pub decoder_seq_length: usize,
    pub make_vocab_size_divisible_by: usize,
    pub share_word_embeddings: bool,
    pub precision: Precision,
    /// Keep fp32 master weights and reduce master gradients.
    pub megatron_amp_o2: bool,
    pub max_steps: Option<u64>,
    pub gradient_clip_val: Option<f64>,
    pub loss_scale: LossScaleConfig,
    pub dataloader_type: DataLoaderType,
    pub seed: u64,
    pub resume_from_checkpoint: Option<String>,
    pub optim: SgdConfig,
    pub sched: Option<LrSchedule>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            micro_batch_size: 4,
            global_batch_size: 8,
            tensor_model_parallel_size: 1,
            pipeline_model_parallel_size: 1,
            pipeline_model_parallel_split_rank: None,
            hidden_size: 512,
            encoder_seq_length: 512,
            decoder_seq_length: 128,
            make_vocab_size_divisible_by: 128,
            share_word_embeddings: true,
            precision: Precision::Fp32,
            megatron_amp_o2: false,
            max_steps: None,
            gradient_clip_val: Some(1.0),
            loss_scale: LossScaleConfig::default(),
            dataloader_type: DataLoaderType::Single,
            seed: 1234,
            resume_from_checkpoint: None,
            optim: SgdConfig::default(),
            sched: None,
        }
    }
}

impl TrainingConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| Error::ConfigError {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::ConfigError {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.micro_batch_size == 0 || self.global_batch_size == 0 {
            return Err(Error::ConfigError {
                reason: "micro_batch_size and global_batch_size must be > 0".to_string(),
            });
        }
        if self.tensor_model_parallel_size == 0 || self.pipeline_model_parallel_size == 0 {
            return Err(Error::ConfigError {
                reason: "model parallel sizes must be > 0".to_string(),
            });
        }
        if let Some(split) = self.pipeline_model_parallel_split_rank
            && split >= self.pipeline_model_parallel_size
        {
            return Err(Error::ConfigError {
                reason: format!(
                    "pipeline_model_parallel_split_rank ({split}) must be < \
                     pipeline_model_parallel_size ({})",
                    self.pipeline_model_parallel_size
                ),
            });
        }
        if self.megatron_amp_o2 && self.max_steps.is_none() {
            return Err(Error::ConfigError {
                reason: "megatron_amp_o2 requires max_steps to be set".to_string(),
            });
        }
        if self.make_vocab_size_divisible_by == 0 {
            return Err(Error::ConfigError {
                reason: "make_vocab_size_divisible_by must be > 0".to_string(),
            });
        }
        self.optim.validate()
    }

    /// Microbatch count per replica for a given data-parallel size.
    pub fn microbatch_calculator(&self, data_parallel_size: usize) -> Result<MicrobatchCalculator> {
        MicrobatchCalculator::new(
            self.global_batch_size,
            self.micro_batch_size,
            data_parallel_size,
        )
    }

    pub fn grad_clip(&self) -> Option<GradClip> {
        GradClip::from_config(self.gradient_clip_val)
    }

    /// Loss scaler for fp16 runs, `None` otherwise.
    pub fn grad_scaler(&self) -> Result<Option<GradScaler>> {
        if self.precision.needs_loss_scaling() {
            self.loss_scale.to_grad_scaler().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn with_batch_sizes(mut self, micro: usize, global: usize) -> Self {
        self.micro_batch_size = micro;
        self.global_batch_size = global;
        self
    }

    pub fn with_model_parallel(mut self, tensor: usize, pipeline: usize) -> Self {
        self.tensor_model_parallel_size = tensor;
        self.pipeline_model_parallel_size = pipeline;
        self
    }

    pub fn with_split_rank(mut self, split: Option<usize>) -> Self {
        self.pipeline_model_parallel_split_rank = split;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_amp_o2(mut self, enabled: bool) -> Self {
        self.megatron_amp_o2 = enabled;
        self
    }

    pub fn with_max_steps(mut self, steps: Option<u64>) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_gradient_clip_val(mut self, val: Option<f64>) -> Self {
        self.gradient_clip_val = val;
        self
    }

    pub fn with_optim(mut self, optim: SgdConfig) -> Self {
        self.optim = optim;
        self
    }

    pub fn with_sched(mut self, sched: Option<LrSchedule>) -> Self {
        self.sched = sched;
        self
    }
}

/// Metrics from one training step, as logged on world rank 0.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    pub global_step: u64,
    pub reduced_train_loss: f64,
    pub lr: f64,
    pub consumed_samples: u64,
    pub grad_norm: Option<f64>,
    pub loss_scale: Option<f64>,
    /// The optimizer update was skipped on overflow.
    pub skipped: bool,
}
