//! Activation send/recv between adjacent pipeline stages.
//!
//! A stage exchanges up to [`SLOTS`] tensors per micro-batch (the encoder
//! hidden state, plus the decoder hidden state after the split). Each
//! tensor gets its own tag:
//!
//! `((mb_id * 2 + is_backward) * SLOTS + slot) * 2`
//!
//! The trailing `* 2` leaves room for the header/payload pair a
//! [`CommGroup`](crate::distributed::group::CommGroup) puts on `tag` and
//! `tag + 1`.

use crate::distributed::group::ProcessGroup;
use crate::error::{Error, Result};
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Maximum number of tensors exchanged per micro-batch and direction.
pub const SLOTS: usize = 2;

/// Communication tag of one activation (or activation gradient) transfer.
pub fn activation_tag(mb_id: usize, is_backward: bool, slot: usize) -> Result<u32> {
    if slot >= SLOTS {
        return Err(Error::DistributedError {
            reason: format!("activation slot {slot} exceeds {SLOTS} slots"),
        });
    }
    let tag = mb_id
        .checked_mul(2)
        .and_then(|v| v.checked_add(usize::from(is_backward)))
        .and_then(|v| v.checked_mul(SLOTS))
        .and_then(|v| v.checked_add(slot))
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(|| Error::DistributedError {
            reason: format!("micro-batch id {mb_id} overflows tag range"),
        })?;
    u32::try_from(tag).map_err(|_| Error::DistributedError {
        reason: format!("tag overflow for mb_id={mb_id}"),
    })
}

/// Send each tensor of `tensors` to `dest`, one slot per tensor.
pub fn send_activations<R: Runtime>(
    group: &dyn ProcessGroup<R>,
    tensors: &[Tensor<R>],
    dest: usize,
    mb_id: usize,
    is_backward: bool,
) -> Result<()> {
    for (slot, tensor) in tensors.iter().enumerate() {
        group.send(tensor, dest, activation_tag(mb_id, is_backward, slot)?)?;
    }
    Ok(())
}

/// Receive one tensor per entry of `expected` from `src` and check its shape.
pub fn recv_activations<R: Runtime>(
    group: &dyn ProcessGroup<R>,
    src: usize,
    mb_id: usize,
    is_backward: bool,
    expected: &[[usize; 3]],
) -> Result<Vec<Tensor<R>>> {
    let mut out = Vec::with_capacity(expected.len());
    for (slot, shape) in expected.iter().enumerate() {
        let tensor = group.recv(src, activation_tag(mb_id, is_backward, slot)?)?;
        if tensor.shape() != shape.as_slice() {
            return Err(Error::ShapeMismatch {
                reason: format!(
                    "{} slot {slot} of micro-batch {mb_id} from stage {src}: expected {:?}, got {:?}",
                    if is_backward { "gradient" } else { "activation" },
                    shape,
                    tensor.shape()
                ),
            });
        }
        out.push(tensor);
    }
    Ok(out)
}
