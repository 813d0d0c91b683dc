//! Prompt completion: greedy decoding plus token/text post-processing.

use serde::{Deserialize, Serialize};

use crate::distributed::ProcessGroup;
use crate::error::{Error, Result};
use crate::inference::decode::{DecodedToken, GreedyDecoder, Seq2SeqModel, TokenId, Tokenizer};
use numr::dtype::DType;
use numr::ops::{TensorOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Original prompt text, echoed back.
    pub prompt: String,
    /// Encoder input ids, possibly containing sentinel/mask tokens.
    pub masked_sample: Vec<TokenId>,
    pub tokens_to_generate: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub prompt: String,
    /// Space-joined tokens of the encoder input.
    pub masked_input: String,
    pub completion: Completion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// `(id, token, log_prob)` per kept token.
    pub tokens: Vec<(TokenId, String, f32)>,
}

/// Keep everything before the first EOS; without one, drop pad tokens.
pub fn trim_completion(decoded: &[DecodedToken], eos_id: TokenId, pad_id: TokenId) -> Vec<DecodedToken> {
    match decoded.iter().position(|t| t.id == eos_id) {
        Some(idx) => decoded[..idx].to_vec(),
        None => decoded.iter().filter(|t| t.id != pad_id).copied().collect(),
    }
}

/// Greedily complete `request.masked_sample`.
///
/// The encoder mask marks non-pad tokens. Collective over the
/// tensor-parallel group when it has more than one rank.
pub fn complete<R, C, M>(
    client: &C,
    model: &mut M,
    tensor_parallel: &dyn ProcessGroup<R>,
    tokenizer: &dyn Tokenizer,
    request: &CompletionRequest,
    device: &R::Device,
) -> Result<CompletionResponse>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + TypeConversionOps<R>,
    M: Seq2SeqModel<R> + ?Sized,
{
    if request.masked_sample.is_empty() {
        return Err(Error::InferenceError {
            reason: "completion request has an empty masked_sample".to_string(),
        });
    }
    let pad_id = tokenizer.pad_id();
    let len = request.masked_sample.len();
    let ids: Vec<i64> = request.masked_sample.iter().map(|&id| i64::from(id)).collect();
    let mask: Vec<i64> = request
        .masked_sample
        .iter()
        .map(|&id| i64::from(id != pad_id))
        .collect();
    let tokens = Tensor::<R>::from_slice(ids.as_slice(), &[1, len], device);
    let mask = Tensor::<R>::from_slice(mask.as_slice(), &[1, len], device);

    let decoded = GreedyDecoder::new(
        client,
        model,
        tensor_parallel,
        tokenizer,
        tokens,
        mask,
        request.tokens_to_generate,
        device.clone(),
    )
    .collect::<Result<Vec<_>>>()?;

    let kept = trim_completion(&decoded, tokenizer.eos_id(), pad_id);
    let kept_ids: Vec<TokenId> = kept.iter().map(|t| t.id).collect();
    let kept_tokens = tokenizer.ids_to_tokens(&kept_ids);

    Ok(CompletionResponse {
        prompt: request.prompt.clone(),
        masked_input: tokenizer.ids_to_tokens(&request.masked_sample).join(" "),
        completion: Completion {
            text: tokenizer.tokens_to_text(&kept_tokens),
            tokens: kept
                .iter()
                .zip(kept_tokens)
                .map(|(t, token)| (t.id, token, t.log_prob))
                .collect(),
        },
    })
}
