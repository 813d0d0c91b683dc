//! Vocabulary padding for tensor-parallel embedding shards.

use crate::error::{Error, Result};

/// Pad `orig_vocab_size` up to the next multiple of
/// `divisible_by * tensor_parallel_size`, so every tensor-parallel shard of
/// the embedding table has the same GPU-friendly row count.
pub fn vocab_size_with_padding(
    orig_vocab_size: usize,
    divisible_by: usize,
    tensor_parallel_size: usize,
) -> Result<usize> {
    let multiple = divisible_by
        .checked_mul(tensor_parallel_size)
        .filter(|&m| m > 0)
        .ok_or_else(|| Error::ConfigError {
            reason: format!(
                "make_vocab_size_divisible_by ({divisible_by}) and tensor parallel size \
                 ({tensor_parallel_size}) must be positive"
            ),
        })?;
    let padded = orig_vocab_size.div_ceil(multiple) * multiple;
    tracing::info!(
        padded_vocab_size = padded,
        orig_vocab_size,
        dummy_tokens = padded - orig_vocab_size,
        "padded vocab size"
    );
    Ok(padded)
}
