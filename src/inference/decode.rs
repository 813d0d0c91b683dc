//! Greedy autoregressive decoding for the encoder-decoder model.
//!
//! [`GreedyDecoder`] is a lazy iterator: the first `next()` runs the encoder
//! once and caches its output, every call then runs one decoder pass over
//! the growing prefix and yields the arg-max token at the last position with
//! its log-probability. It stops after `max_tokens` tokens or right after
//! yielding the end-of-sequence token, and never restarts.

use crate::distributed::{ProcessGroup, gather_along_dim};
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::ops::{TensorOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Token ID type
pub type TokenId = u32;

/// The forward path the decoder reuses.
pub trait Seq2SeqModel<R: Runtime> {
    /// Encoder hidden states for `tokens` `[1, s]` under `mask` `[1, s]`.
    fn encode(&mut self, tokens: &Tensor<R>, mask: &Tensor<R>) -> Result<Tensor<R>>;

    /// Logits `[1, t, vocab / tp]` (this rank's vocab shard) for the decoder
    /// prefix `decoder_tokens` `[1, t]`.
    fn decode_step(
        &mut self,
        tokens: &Tensor<R>,
        mask: &Tensor<R>,
        decoder_tokens: &Tensor<R>,
        decoder_mask: &Tensor<R>,
        encoder_hidden: &Tensor<R>,
    ) -> Result<Tensor<R>>;
}

/// Id/text conversions plus the special ids decoding relies on.
pub trait Tokenizer {
    fn ids_to_tokens(&self, ids: &[TokenId]) -> Vec<String>;
    fn tokens_to_text(&self, tokens: &[String]) -> String;
    fn bos_id(&self) -> TokenId;
    fn eos_id(&self) -> TokenId;
    fn pad_id(&self) -> TokenId;
}

/// One generated token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedToken {
    pub id: TokenId,
    pub log_prob: f32,
}

enum DecodeState<R: Runtime> {
    Encoding,
    Step { encoder_hidden: Tensor<R> },
    Done,
}

/// Greedy decoding state machine over a single sequence.
pub struct GreedyDecoder<'a, R, C, M>
where
    R: Runtime,
    M: Seq2SeqModel<R> + ?Sized,
{
    client: &'a C,
    model: &'a mut M,
    tensor_parallel: &'a dyn ProcessGroup<R>,
    device: R::Device,
    tokens: Tensor<R>,
    mask: Tensor<R>,
    prefix: Vec<TokenId>,
    pad_id: TokenId,
    eos_id: TokenId,
    max_tokens: usize,
    state: DecodeState<R>,
}

impl<'a, R, C, M> GreedyDecoder<'a, R, C, M>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + TypeConversionOps<R>,
    M: Seq2SeqModel<R> + ?Sized,
{
    /// `tokens` and `mask` are the encoder input `[1, s]`. The decoder prefix
    /// starts as `[bos_id]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a C,
        model: &'a mut M,
        tensor_parallel: &'a dyn ProcessGroup<R>,
        tokenizer: &dyn Tokenizer,
        tokens: Tensor<R>,
        mask: Tensor<R>,
        max_tokens: usize,
        device: R::Device,
    ) -> Self {
        Self {
            client,
            model,
            tensor_parallel,
            device,
            tokens,
            mask,
            prefix: vec![tokenizer.bos_id()],
            pad_id: tokenizer.pad_id(),
            eos_id: tokenizer.eos_id(),
            max_tokens,
            state: DecodeState::Encoding,
        }
    }

    /// Decoder input so far, starting with the BOS token.
    pub fn prefix(&self) -> &[TokenId] {
        &self.prefix
    }

    fn generated(&self) -> usize {
        self.prefix.len() - 1
    }

    fn step(&mut self, encoder_hidden: &Tensor<R>) -> Result<DecodedToken> {
        let t = self.prefix.len();
        let ids: Vec<i64> = self.prefix.iter().map(|&id| i64::from(id)).collect();
        let dec_mask: Vec<i64> = self
            .prefix
            .iter()
            .map(|&id| i64::from(id != self.pad_id))
            .collect();
        let decoder_tokens = Tensor::<R>::from_slice(ids.as_slice(), &[1, t], &self.device);
        let decoder_mask = Tensor::<R>::from_slice(dec_mask.as_slice(), &[1, t], &self.device);

        let shard = self.model.decode_step(
            &self.tokens,
            &self.mask,
            &decoder_tokens,
            &decoder_mask,
            encoder_hidden,
        )?;
        if shard.shape().len() != 3 || shard.shape()[1] != t {
            return Err(Error::ShapeMismatch {
                reason: format!("expected logits [1, {t}, vocab], got {:?}", shard.shape()),
            });
        }
        let logits = gather_along_dim(self.client, self.tensor_parallel, &shard, -1)?;
        let last = logits.narrow(1, t - 1, 1)?.contiguous();
        let last = if last.dtype() == DType::F32 {
            last
        } else {
            self.client.cast(&last, DType::F32)?
        };
        greedy_pick(&last.to_vec::<f32>())
    }
}

/// Arg-max of `logits` (first index on ties) and its log-softmax value.
fn greedy_pick(logits: &[f32]) -> Result<DecodedToken> {
    let Some(&first) = logits.first() else {
        return Err(Error::InferenceError {
            reason: "empty logits".to_string(),
        });
    };
    let (best, best_logit) = logits
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, first), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
    let exp_sum: f32 = logits.iter().map(|&x| (x - best_logit).exp()).sum();
    let id = TokenId::try_from(best).map_err(|_| Error::InferenceError {
        reason: format!("token index {best} out of range"),
    })?;
    Ok(DecodedToken {
        id,
        log_prob: -exp_sum.ln(),
    })
}

impl<R, C, M> Iterator for GreedyDecoder<'_, R, C, M>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + TypeConversionOps<R>,
    M: Seq2SeqModel<R> + ?Sized,
{
    type Item = Result<DecodedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        let encoder_hidden = match std::mem::replace(&mut self.state, DecodeState::Done) {
            DecodeState::Done => return None,
            DecodeState::Encoding => match self.model.encode(&self.tokens, &self.mask) {
                Ok(hidden) => hidden,
                Err(e) => return Some(Err(e)),
            },
            DecodeState::Step { encoder_hidden } => encoder_hidden,
        };
        if self.generated() >= self.max_tokens {
            return None;
        }
        let token = match self.step(&encoder_hidden) {
            Ok(token) => token,
            Err(e) => return Some(Err(e)),
        };
        self.prefix.push(token.id);
        if token.id != self.eos_id && self.generated() < self.max_tokens {
            self.state = DecodeState::Step { encoder_hidden };
        }
        Some(Ok(token))
    }
}
