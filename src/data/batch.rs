//! Global-batch assembly.
//!
//! A data loader yields a list of host-resident [`MicroBatch`]es per step.
//! [`assemble`] concatenates them along the batch dimension, in order, into
//! one [`AssembledBatch`]; the scheduler later slices microbatch `k` back out
//! with [`AssembledBatch::micro_batch`].
//!
//! # Mask tiling
//!
//! Each microbatch carries ONE encoder mask and ONE decoder mask shared by
//! every example in it. Assembly repeats each mask once per example, so the
//! assembled masks are per-example. Upstream data preparation must therefore
//! produce masks that are valid for all examples of a microbatch; padding
//! that differs per example is not representable.

use crate::error::{Error, Result};
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// One microbatch as produced by the data loader.
///
/// Token tensors are `[micro_batch_size, seq_len]`; masks have a leading
/// dimension that is shared by every example (usually 1).
pub struct MicroBatch<R: Runtime> {
    pub encoder_tokens: Tensor<R>,
    pub decoder_tokens: Tensor<R>,
    pub labels: Tensor<R>,
    pub loss_mask: Tensor<R>,
    pub encoder_mask: Tensor<R>,
    pub decoder_mask: Tensor<R>,
}

impl<R: Runtime> Clone for MicroBatch<R> {
    fn clone(&self) -> Self {
        Self {
            encoder_tokens: self.encoder_tokens.clone(),
            decoder_tokens: self.decoder_tokens.clone(),
            labels: self.labels.clone(),
            loss_mask: self.loss_mask.clone(),
            encoder_mask: self.encoder_mask.clone(),
            decoder_mask: self.decoder_mask.clone(),
        }
    }
}

impl<R: Runtime> MicroBatch<R> {
    /// Number of examples (leading dim of the encoder tokens).
    pub fn micro_batch_size(&self) -> Result<usize> {
        leading_dim(&self.encoder_tokens, "encoder_tokens")
    }

    pub fn encoder_seq_len(&self) -> usize {
        self.encoder_tokens.shape().get(1).copied().unwrap_or(0)
    }

    pub fn decoder_seq_len(&self) -> usize {
        self.decoder_tokens.shape().get(1).copied().unwrap_or(0)
    }
}

fn leading_dim<R: Runtime>(t: &Tensor<R>, what: &str) -> Result<usize> {
    t.shape().first().copied().ok_or_else(|| Error::DataError {
        reason: format!("{what} has no batch dimension"),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct MicroSpans {
    examples: Span,
    encoder_mask: Span,
    decoder_mask: Span,
}

/// Six concatenated tensors covering the whole global batch.
pub struct AssembledBatch<R: Runtime> {
    pub encoder_tokens: Tensor<R>,
    pub decoder_tokens: Tensor<R>,
    pub labels: Tensor<R>,
    pub loss_mask: Tensor<R>,
    pub encoder_mask: Tensor<R>,
    pub decoder_mask: Tensor<R>,
    spans: Vec<MicroSpans>,
}

impl<R: Runtime> AssembledBatch<R> {
    pub fn num_microbatches(&self) -> usize {
        self.spans.len()
    }

    pub fn total_examples(&self) -> usize {
        self.spans.iter().map(|s| s.examples.len).sum()
    }

    pub fn encoder_seq_len(&self) -> usize {
        self.encoder_tokens.shape().get(1).copied().unwrap_or(0)
    }

    pub fn decoder_seq_len(&self) -> usize {
        self.decoder_tokens.shape().get(1).copied().unwrap_or(0)
    }

    /// Size of the first microbatch; the pipeline tensor shape is built from it.
    pub fn micro_batch_size(&self) -> usize {
        self.spans.first().map(|s| s.examples.len).unwrap_or(0)
    }

    /// Slice microbatch `k` back out of the assembled tensors.
    ///
    /// Token, label and loss-mask tensors are exactly the loader's originals.
    /// Masks come back per-example (tiled), as assembled.
    pub fn micro_batch(&self, k: usize) -> Result<MicroBatch<R>> {
        let spans = self.spans.get(k).ok_or_else(|| Error::DataError {
            reason: format!(
                "microbatch {k} out of range for a batch of {}",
                self.spans.len()
            ),
        })?;
        let ex = spans.examples;
        let slice = |t: &Tensor<R>, span: Span| -> Result<Tensor<R>> {
            Ok(t.narrow(0, span.start, span.len)?.contiguous())
        };
        Ok(MicroBatch {
            encoder_tokens: slice(&self.encoder_tokens, ex)?,
            decoder_tokens: slice(&self.decoder_tokens, ex)?,
            labels: slice(&self.labels, ex)?,
            loss_mask: slice(&self.loss_mask, ex)?,
            encoder_mask: slice(&self.encoder_mask, spans.encoder_mask)?,
            decoder_mask: slice(&self.decoder_mask, spans.decoder_mask)?,
        })
    }
}

/// Concatenate a global batch along dim 0, preserving microbatch order.
///
/// Microbatches with differing sequence lengths fail inside the concat and
/// surface as a numr shape error.
pub fn assemble<R, C>(client: &C, global_batch: &[MicroBatch<R>]) -> Result<AssembledBatch<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + TensorOps<R>,
{
    if global_batch.is_empty() {
        return Err(Error::DataError {
            reason: "empty global batch".to_string(),
        });
    }

    let mut spans = Vec::with_capacity(global_batch.len());
    let (mut ex_at, mut enc_at, mut dec_at) = (0usize, 0usize, 0usize);
    let mut enc_masks: Vec<&Tensor<R>> = Vec::new();
    let mut dec_masks: Vec<&Tensor<R>> = Vec::new();

    for mb in global_batch {
        let n = mb.micro_batch_size()?;
        let enc_rows = leading_dim(&mb.encoder_mask, "encoder_mask")? * n;
        let dec_rows = leading_dim(&mb.decoder_mask, "decoder_mask")? * n;

        enc_masks.extend(std::iter::repeat_n(&mb.encoder_mask, n));
        dec_masks.extend(std::iter::repeat_n(&mb.decoder_mask, n));

        spans.push(MicroSpans {
            examples: Span { start: ex_at, len: n },
            encoder_mask: Span { start: enc_at, len: enc_rows },
            decoder_mask: Span { start: dec_at, len: dec_rows },
        });
        ex_at += n;
        enc_at += enc_rows;
        dec_at += dec_rows;
    }

    let cat = |pick: fn(&MicroBatch<R>) -> &Tensor<R>| -> Result<Tensor<R>> {
        let refs: Vec<&Tensor<R>> = global_batch.iter().map(pick).collect();
        Ok(client.cat(&refs, 0)?)
    };

    Ok(AssembledBatch {
        encoder_tokens: cat(|mb| &mb.encoder_tokens)?,
        decoder_tokens: cat(|mb| &mb.decoder_tokens)?,
        labels: cat(|mb| &mb.labels)?,
        loss_mask: cat(|mb| &mb.loss_mask)?,
        encoder_mask: client.cat(&enc_masks, 0)?,
        decoder_mask: client.cat(&dec_masks, 0)?,
        spans,
    })
}
