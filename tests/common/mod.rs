//! A toy pipeline stage with host-side math.
//!
//! Every stage owns one scalar weight `w`. Activations are `[S, b, 1]`:
//!
//! - the first stage embeds encoder tokens as `x[s, b] = token[b, s]`;
//! - every stage emits `w * x` as its encoder hidden state;
//! - the stage at the split turns decoder tokens into `d[t, b] = token[b, t]`
//!   and later stages pass `d` through unchanged;
//! - the last stage's per-token loss is `sum_s w * x[s, b] + d[t, b]`.
//!
//! So with every weight at 1, each stage's weight gradient is the mean over
//! microbatches and tokens of `sum_s token[b, s]`.

#![allow(dead_code)]

use std::collections::HashMap;

use numr::autograd::GradStore;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::{Tensor, TensorId};
use seqpipe::Result;
use seqpipe::data::MicroBatch;
use seqpipe::distributed::pipeline::{ActivationStash, PipelineStageModel};
use seqpipe::model::ParamMeta;

pub fn cpu_setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

pub struct ToyStage {
    pub rank: usize,
    pub num_stages: usize,
    pub split: Option<usize>,
    pub weight_id: TensorId,
    pub forward_order: Vec<usize>,
    pub backward_order: Vec<usize>,
    /// Report a NaN gradient on the next `take_grads`.
    pub poison_next: bool,
    params: HashMap<TensorId, Tensor<CpuRuntime>>,
    stash: ActivationStash<CpuRuntime>,
    grad_acc: f32,
    device: CpuDevice,
}

impl ToyStage {
    pub fn new(rank: usize, num_stages: usize, split: Option<usize>, w: f32, device: &CpuDevice) -> Self {
        let weight = Tensor::<CpuRuntime>::from_slice(&[w], &[1], device);
        let weight_id = weight.id();
        Self {
            rank,
            num_stages,
            split,
            weight_id,
            forward_order: Vec::new(),
            backward_order: Vec::new(),
            poison_next: false,
            params: HashMap::from([(weight_id, weight)]),
            stash: ActivationStash::new(),
            grad_acc: 0.0,
            device: device.clone(),
        }
    }

    pub fn weight(&self) -> f32 {
        self.params[&self.weight_id].to_vec::<f32>()[0]
    }

    fn before_split(&self, stage: usize) -> bool {
        self.num_stages == 1 || self.split.is_none_or(|k| stage < k)
    }

    /// Whether this stage creates the decoder hidden state.
    fn starts_decoder(&self) -> bool {
        !self.before_split(self.rank) && (self.rank == 0 || self.before_split(self.rank - 1))
    }

    fn receives_decoder(&self) -> bool {
        self.rank > 0 && !self.before_split(self.rank - 1)
    }

    fn tokens_as_activation(&self, tokens: &Tensor<CpuRuntime>) -> Tensor<CpuRuntime> {
        let [b, s] = [tokens.shape()[0], tokens.shape()[1]];
        let host = tokens.to_vec::<i64>();
        let mut out = vec![0.0f32; s * b];
        for bi in 0..b {
            for si in 0..s {
                out[si * b + bi] = host[bi * s + si] as f32;
            }
        }
        Tensor::from_slice(&out, &[s, b, 1], &self.device)
    }
}

fn host(t: &Tensor<CpuRuntime>) -> Vec<f32> {
    t.contiguous().to_vec::<f32>()
}

impl PipelineStageModel<CpuRuntime> for ToyStage {
    fn pre_process(&self) -> bool {
        self.rank == 0
    }

    fn post_process(&self) -> bool {
        self.rank + 1 == self.num_stages
    }

    fn forward(
        &mut self,
        micro_batch_id: usize,
        batch: &MicroBatch<CpuRuntime>,
        mut inputs: Vec<Tensor<CpuRuntime>>,
    ) -> Result<Vec<Tensor<CpuRuntime>>> {
        self.forward_order.push(micro_batch_id);
        let w = self.weight();

        let (enc_in, mut dec_in) = if self.pre_process() {
            (self.tokens_as_activation(&batch.encoder_tokens), None)
        } else if inputs.len() == 2 {
            let enc = inputs.remove(1);
            (enc, Some(inputs.remove(0)))
        } else {
            (inputs.remove(0), None)
        };
        if self.starts_decoder() {
            dec_in = Some(self.tokens_as_activation(&batch.decoder_tokens));
        }

        let shape = enc_in.shape().to_vec();
        let enc_out: Vec<f32> = host(&enc_in).iter().map(|x| w * x).collect();
        let enc_out = Tensor::<CpuRuntime>::from_slice(&enc_out, &shape, &self.device);

        let mut saved = vec![enc_in];
        saved.extend(dec_in.clone());
        self.stash.save(micro_batch_id, saved)?;

        if self.post_process() {
            let [s, b] = [shape[0], shape[1]];
            let t = batch.decoder_tokens.shape()[1];
            let h = host(&enc_out);
            let d = dec_in.as_ref().map(host);
            let mut loss = vec![0.0f32; b * t];
            for bi in 0..b {
                let enc_sum: f32 = (0..s).map(|si| h[si * b + bi]).sum();
                for ti in 0..t {
                    loss[bi * t + ti] = enc_sum + d.as_ref().map_or(0.0, |d| d[ti * b + bi]);
                }
            }
            return Ok(vec![Tensor::from_slice(&loss, &[b, t], &self.device)]);
        }
        match dec_in {
            Some(dec) if !self.before_split(self.rank) => Ok(vec![dec, enc_out]),
            _ => Ok(vec![enc_out]),
        }
    }

    fn backward(
        &mut self,
        micro_batch_id: usize,
        mut output_grads: Vec<Tensor<CpuRuntime>>,
    ) -> Result<Vec<Tensor<CpuRuntime>>> {
        self.backward_order.push(micro_batch_id);
        let w = self.weight();
        let saved = self.stash.take(micro_batch_id)?;
        let enc_in = &saved[0];
        let shape = enc_in.shape().to_vec();
        let [s, b] = [shape[0], shape[1]];

        let (d_enc_out, d_dec): (Vec<f32>, Option<Tensor<CpuRuntime>>) = if self.post_process() {
            let g_shape = output_grads[0].shape().to_vec();
            let t = g_shape[1];
            let g = host(&output_grads[0]);
            let mut d_enc = vec![0.0f32; s * b];
            let mut d_dec = vec![0.0f32; t * b];
            for bi in 0..b {
                let row: f32 = (0..t).map(|ti| g[bi * t + ti]).sum();
                for si in 0..s {
                    d_enc[si * b + bi] = row;
                }
                for ti in 0..t {
                    d_dec[ti * b + bi] = g[bi * t + ti];
                }
            }
            (d_enc, Some(Tensor::from_slice(&d_dec, &[t, b, 1], &self.device)))
        } else if output_grads.len() == 2 {
            let d_enc = host(&output_grads.remove(1));
            (d_enc, Some(output_grads.remove(0)))
        } else {
            (host(&output_grads.remove(0)), None)
        };

        let x = host(enc_in);
        self.grad_acc += x.iter().zip(&d_enc_out).map(|(x, g)| x * g).sum::<f32>();

        if self.pre_process() {
            return Ok(Vec::new());
        }
        let d_enc_in: Vec<f32> = d_enc_out.iter().map(|g| w * g).collect();
        let d_enc_in = Tensor::<CpuRuntime>::from_slice(&d_enc_in, &shape, &self.device);
        if self.receives_decoder() {
            let d_dec = d_dec.ok_or_else(|| seqpipe::Error::TrainingError {
                reason: "missing decoder gradient".to_string(),
            })?;
            Ok(vec![d_dec, d_enc_in])
        } else {
            Ok(vec![d_enc_in])
        }
    }

    fn parameters(&self) -> Vec<ParamMeta> {
        vec![ParamMeta::new(
            format!("encoder.layers.{}.weight", self.rank),
            self.weight_id,
        )]
    }

    fn params(&self) -> &HashMap<TensorId, Tensor<CpuRuntime>> {
        &self.params
    }

    fn params_mut(&mut self) -> &mut HashMap<TensorId, Tensor<CpuRuntime>> {
        &mut self.params
    }

    fn take_grads(&mut self) -> GradStore<CpuRuntime> {
        let value = if std::mem::take(&mut self.poison_next) {
            f32::NAN
        } else {
            std::mem::take(&mut self.grad_acc)
        };
        self.grad_acc = 0.0;
        let mut grads = GradStore::new();
        grads.insert(
            self.weight_id,
            Tensor::<CpuRuntime>::from_slice(&[value], &[1], &self.device),
        );
        grads
    }
}

/// `count` microbatches of `mbs` examples; encoder tokens count up from
/// `base`, decoder tokens are all `dec_value`.
pub fn micro_batches(
    device: &CpuDevice,
    count: usize,
    mbs: usize,
    enc_len: usize,
    dec_len: usize,
    base: i64,
    dec_value: i64,
) -> Vec<MicroBatch<CpuRuntime>> {
    (0..count)
        .map(|k| {
            let start = base + (k * mbs * enc_len) as i64;
            let enc: Vec<i64> = (0..(mbs * enc_len) as i64).map(|i| start + i).collect();
            let dec = vec![dec_value; mbs * dec_len];
            MicroBatch {
                encoder_tokens: Tensor::from_slice(&enc, &[mbs, enc_len], device),
                decoder_tokens: Tensor::from_slice(&dec, &[mbs, dec_len], device),
                labels: Tensor::from_slice(&dec, &[mbs, dec_len], device),
                loss_mask: Tensor::from_slice(&vec![1.0f32; mbs * dec_len], &[mbs, dec_len], device),
                encoder_mask: Tensor::from_slice(&vec![1.0f32; enc_len * enc_len], &[1, enc_len, enc_len], device),
                decoder_mask: Tensor::from_slice(&vec![1.0f32; dec_len * dec_len], &[1, dec_len, dec_len], device),
            }
        })
        .collect()
}

/// Expected loss of a batch from [`micro_batches`] with unit weights:
/// mean over examples of the encoder-token sum, plus the decoder value if
/// the model has a decoder side.
pub fn expected_loss(batches: &[MicroBatch<CpuRuntime>], dec_term: bool) -> f64 {
    let mut total = 0.0f64;
    let mut examples = 0usize;
    for mb in batches {
        let [b, s] = [mb.encoder_tokens.shape()[0], mb.encoder_tokens.shape()[1]];
        let enc = mb.encoder_tokens.to_vec::<i64>();
        let dec = mb.decoder_tokens.to_vec::<i64>()[0] as f64;
        for bi in 0..b {
            let row: i64 = enc[bi * s..(bi + 1) * s].iter().sum();
            total += row as f64 + if dec_term { dec } else { 0.0 };
            examples += 1;
        }
    }
    total / examples as f64
}
