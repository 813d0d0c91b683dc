//! Loading a full training configuration from disk.

use std::io::Write;

use seqpipe::data::{DataLoaderType, build_sampler};
use seqpipe::model::vocab_size_with_padding;
use seqpipe::optimizer::LrSchedule;
use seqpipe::trainer::{Precision, TrainingConfig};

const RUN_YAML: &str = r#"
micro_batch_size: 4
global_batch_size: 64
tensor_model_parallel_size: 2
pipeline_model_parallel_size: 4
pipeline_model_parallel_split_rank: 2
hidden_size: 768
precision: 16
megatron_amp_o2: true
max_steps: 1000
gradient_clip_val: 1.0
dataloader_type: cyclic
resume_from_checkpoint: "runs/t5/step=200-consumed_samples=12800.0.ckpt"
loss_scale:
  initial_scale: 65536.0
  hysteresis: 2
optim:
  lr: 0.0001
  momentum: 0.9
  weight_decay: 0.01
sched:
  name: cosine_annealing
  base_lr: 0.0001
  min_lr: 0.00001
  warmup_steps: 100
  total_steps: 1000
"#;

#[test]
fn test_load_run_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(RUN_YAML.as_bytes()).unwrap();
    let config = TrainingConfig::load(file.path()).unwrap();

    assert_eq!(config.precision, Precision::Fp16);
    assert!(config.megatron_amp_o2);
    assert_eq!(config.dataloader_type, DataLoaderType::Cyclic);
    assert_eq!(config.pipeline_model_parallel_split_rank, Some(2));
    assert!(matches!(config.sched, Some(LrSchedule::CosineAnnealing { warmup_steps: 100, .. })));
    assert_eq!(config.loss_scale.initial_scale, 65536.0);
    // 64 global = 4 micro * 2 replicas * 8 microbatches
    assert_eq!(config.microbatch_calculator(2).unwrap().num_microbatches(), 8);
    assert_eq!(config.grad_scaler().unwrap().unwrap().scale(), 65536.0);

    let sampler = build_sampler(config.dataloader_type, 100_000, 12_800, config.micro_batch_size, 0, 2).unwrap();
    let first: Vec<usize> = sampler.take(1).flatten().collect();
    assert_eq!(first.len(), 4);
}

#[test]
fn test_amp_o2_without_max_steps_is_rejected() {
    let yaml = "precision: bf16\nmegatron_amp_o2: true\n";
    assert!(TrainingConfig::from_yaml_str(yaml).is_err());
}

#[test]
fn test_unknown_keys_and_precisions_are_rejected() {
    assert!(TrainingConfig::from_yaml_str("micro_batch_sz: 4\n").is_err());
    assert!(TrainingConfig::from_yaml_str("precision: 8\n").is_err());
    assert!(TrainingConfig::from_yaml_str("dataloader_type: shuffled\n").is_err());
}

#[test]
fn test_padded_vocab_for_tensor_parallel_run() {
    let config = TrainingConfig::from_yaml_str(RUN_YAML).unwrap();
    let padded = vocab_size_with_padding(
        50_000,
        config.make_vocab_size_divisible_by,
        config.tensor_model_parallel_size,
    )
    .unwrap();
    assert_eq!(padded, 50_176);
    assert_eq!(padded % (128 * 2), 0);
}
