//! Tensor-level wrappers around numr's raw-pointer `Communicator`.
//!
//! Only [`CommGroup`](super::group::CommGroup) calls into this module; every
//! other component goes through the [`ProcessGroup`](super::group::ProcessGroup)
//! trait.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

/// Header capacity: up to 8 dimensions plus `ndim` and the dtype id.
const MAX_HEADER: usize = 10;

fn require_contiguous<R: Runtime>(tensor: &Tensor<R>, op: &str) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::DistributedError {
            reason: format!("{op} requires a contiguous tensor"),
        })
    }
}

fn comm_error(op: &str, peer: Option<usize>, e: impl std::fmt::Display) -> Error {
    let reason = match peer {
        Some(p) => format!("{op} with rank {p} failed: {e}"),
        None => format!("{op} failed: {e}"),
    };
    Error::DistributedError { reason }
}

/// Sum-reduce a tensor in place across the communicator.
pub(crate) fn all_reduce_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    op: ReduceOp,
) -> Result<()> {
    require_contiguous(tensor, "all_reduce")?;
    // Safety: contiguous buffer of `numel` elements of `dtype`
    unsafe {
        comm.all_reduce(tensor.data_ptr(), tensor.numel(), tensor.dtype(), op)
            .map_err(|e| comm_error("all_reduce", None, e))
    }
}

/// Overwrite `tensor` with the root's copy.
pub(crate) fn broadcast_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    root: usize,
) -> Result<()> {
    require_contiguous(tensor, "broadcast")?;
    // Safety: contiguous buffer of `numel` elements of `dtype`
    unsafe {
        comm.broadcast(tensor.data_ptr(), tensor.numel(), tensor.dtype(), root)
            .map_err(|e| comm_error("broadcast", Some(root), e))
    }
}

/// Send a tensor preceded by its shape header.
///
/// Header `[ndim, dim0, .., dimN, dtype_id]` travels as u64 on `tag`,
/// the payload on `tag + 1`.
pub(crate) fn send_tensor_with_metadata<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    dest: usize,
    tag: u32,
) -> Result<()> {
    require_contiguous(tensor, "send")?;
    let shape = tensor.shape();
    if shape.is_empty() || shape.len() + 2 > MAX_HEADER {
        return Err(Error::DistributedError {
            reason: format!("cannot send a {}-d tensor (1..=8 dims supported)", shape.len()),
        });
    }
    let data_tag = tag.checked_add(1).ok_or_else(|| Error::DistributedError {
        reason: format!("payload tag overflow for tag {tag}"),
    })?;

    let mut header: Vec<u64> = Vec::with_capacity(shape.len() + 2);
    header.push(shape.len() as u64);
    header.extend(shape.iter().map(|&d| d as u64));
    header.push(dtype_to_u64(tensor.dtype()));

    // Safety: header is a live host buffer; tensor is contiguous
    unsafe {
        comm.send(header.as_ptr() as u64, header.len(), DType::U64, dest, tag)
            .map_err(|e| comm_error("send header", Some(dest), e))?;
    }
    comm.sync()
        .map_err(|e| comm_error("sync after header send", Some(dest), e))?;
    unsafe {
        comm.send(
            tensor.data_ptr(),
            tensor.numel(),
            tensor.dtype(),
            dest,
            data_tag,
        )
        .map_err(|e| comm_error("send payload", Some(dest), e))?;
    }
    comm.sync()
        .map_err(|e| comm_error("sync after payload send", Some(dest), e))
}

/// Receive a tensor sent with [`send_tensor_with_metadata`].
pub(crate) fn recv_tensor_with_metadata<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    src: usize,
    tag: u32,
    device: &R::Device,
) -> Result<Tensor<R>> {
    let data_tag = tag.checked_add(1).ok_or_else(|| Error::DistributedError {
        reason: format!("payload tag overflow for tag {tag}"),
    })?;
    let mut header = [0u64; MAX_HEADER];

    // Safety: header is a live host buffer of MAX_HEADER u64s
    unsafe {
        comm.recv(header.as_mut_ptr() as u64, MAX_HEADER, DType::U64, src, tag)
            .map_err(|e| comm_error("recv header", Some(src), e))?;
    }
    comm.sync()
        .map_err(|e| comm_error("sync after header recv", Some(src), e))?;

    let ndim = header[0] as usize;
    if ndim == 0 || ndim + 2 > MAX_HEADER {
        return Err(Error::DistributedError {
            reason: format!("invalid ndim {ndim} in header from rank {src}"),
        });
    }
    let shape: Vec<usize> = header[1..=ndim].iter().map(|&d| d as usize).collect();
    let dtype = u64_to_dtype(header[ndim + 1])?;

    let buffer = Tensor::<R>::zeros(&shape, dtype, device);
    // Safety: freshly allocated contiguous buffer sized from the header
    unsafe {
        comm.recv(buffer.data_ptr(), buffer.numel(), dtype, src, data_tag)
            .map_err(|e| comm_error("recv payload", Some(src), e))?;
    }
    comm.sync()
        .map_err(|e| comm_error("sync after payload recv", Some(src), e))?;

    Ok(buffer)
}

/// Stable `repr(u8)` discriminant of a numr dtype.
fn dtype_to_u64(dtype: DType) -> u64 {
    (dtype as u8) as u64
}

fn u64_to_dtype(val: u64) -> Result<DType> {
    match val {
        0 => Ok(DType::F64),
        1 => Ok(DType::F32),
        2 => Ok(DType::F16),
        3 => Ok(DType::BF16),
        10 => Ok(DType::I64),
        11 => Ok(DType::I32),
        20 => Ok(DType::U64),
        21 => Ok(DType::U32),
        23 => Ok(DType::U8),
        30 => Ok(DType::Bool),
        _ => Err(Error::DistributedError {
            reason: format!("unsupported dtype id {val} in activation header"),
        }),
    }
}
