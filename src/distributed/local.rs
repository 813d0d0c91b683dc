//! In-process process groups for ranks running on threads.
//!
//! A [`LocalHub`] is the shared rendezvous point of one group; each member
//! thread holds a [`LocalGroup`] bound to its rank. Tensors cross the hub as
//! host buffers, so any runtime works as long as the dtype is F32, F64 or I64.
//!
//! Collectives follow a two-phase rendezvous: members deposit their
//! contribution and block until the last one arrives, then every member
//! collects the shared result and the round closes once all have left.
//! Point-to-point transfers go through a `(src, dst, tag)` mailbox.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::distributed::group::ProcessGroup;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

#[derive(Debug, Clone)]
enum HostData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

#[derive(Debug, Clone)]
struct HostTensor {
    shape: Vec<usize>,
    data: HostData,
}

impl HostTensor {
    fn from_tensor<R: Runtime<DType = DType>>(tensor: &Tensor<R>) -> Result<Self> {
        let t = tensor.contiguous();
        let data = match t.dtype() {
            DType::F32 => HostData::F32(t.to_vec::<f32>()),
            DType::F64 => HostData::F64(t.to_vec::<f64>()),
            DType::I64 => HostData::I64(t.to_vec::<i64>()),
            other => {
                return Err(Error::DistributedError {
                    reason: format!("local process group cannot carry {other} tensors"),
                });
            }
        };
        Ok(Self {
            shape: t.shape().to_vec(),
            data,
        })
    }

    fn to_tensor<R: Runtime<DType = DType>>(&self, device: &R::Device) -> Tensor<R> {
        match &self.data {
            HostData::F32(v) => Tensor::<R>::from_slice(v.as_slice(), &self.shape, device),
            HostData::F64(v) => Tensor::<R>::from_slice(v.as_slice(), &self.shape, device),
            HostData::I64(v) => Tensor::<R>::from_slice(v.as_slice(), &self.shape, device),
        }
    }

    /// Element-wise sum in rank order, so every member computes the same bits.
    fn sum(parts: &[HostTensor]) -> Result<HostTensor> {
        let first = parts.first().ok_or_else(|| Error::DistributedError {
            reason: "all_reduce over an empty group".to_string(),
        })?;
        let mut acc = first.clone();
        for part in &parts[1..] {
            if part.shape != acc.shape {
                return Err(Error::DistributedError {
                    reason: format!(
                        "all_reduce shape mismatch across ranks: {:?} vs {:?}",
                        acc.shape, part.shape
                    ),
                });
            }
            match (&mut acc.data, &part.data) {
                (HostData::F32(a), HostData::F32(b)) => a.iter_mut().zip(b).for_each(|(x, y)| *x += y),
                (HostData::F64(a), HostData::F64(b)) => a.iter_mut().zip(b).for_each(|(x, y)| *x += y),
                (HostData::I64(a), HostData::I64(b)) => a.iter_mut().zip(b).for_each(|(x, y)| *x += y),
                _ => {
                    return Err(Error::DistributedError {
                        reason: "all_reduce dtype mismatch across ranks".to_string(),
                    });
                }
            }
        }
        Ok(acc)
    }
}

#[derive(Default)]
struct HubState {
    slots: Vec<Option<HostTensor>>,
    arrived: usize,
    departed: usize,
    draining: bool,
    result: Option<Arc<Vec<HostTensor>>>,
    mailbox: HashMap<(usize, usize, u32), VecDeque<HostTensor>>,
}

/// Shared rendezvous for one in-process group.
pub struct LocalHub {
    world_size: usize,
    state: Mutex<HubState>,
    changed: Condvar,
}

impl LocalHub {
    pub fn new(world_size: usize) -> Result<Arc<Self>> {
        if world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "world_size",
                reason: "a process group needs at least one member".to_string(),
            });
        }
        let state = HubState {
            slots: vec![None; world_size],
            ..HubState::default()
        };
        Ok(Arc::new(Self {
            world_size,
            state: Mutex::new(state),
            changed: Condvar::new(),
        }))
    }

    /// Create the member handle for `rank`.
    pub fn member<R: Runtime>(self: &Arc<Self>, rank: usize, device: R::Device) -> Result<LocalGroup<R>> {
        if rank >= self.world_size {
            return Err(Error::InvalidArgument {
                arg: "rank",
                reason: format!("rank {rank} >= world_size {}", self.world_size),
            });
        }
        Ok(LocalGroup {
            hub: Arc::clone(self),
            rank,
            device,
            _runtime: PhantomData,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>> {
        self.state.lock().map_err(|_| Error::DistributedError {
            reason: "local process group poisoned by a panicked member".to_string(),
        })
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, HubState>) -> Result<MutexGuard<'a, HubState>> {
        self.changed.wait(guard).map_err(|_| Error::DistributedError {
            reason: "local process group poisoned by a panicked member".to_string(),
        })
    }

    /// Deposit `contribution` and return every member's contribution in rank order.
    fn exchange(&self, rank: usize, contribution: HostTensor) -> Result<Arc<Vec<HostTensor>>> {
        let mut st = self.lock()?;
        while st.draining {
            st = self.wait(st)?;
        }
        if st.slots[rank].is_some() {
            return Err(Error::DistributedError {
                reason: format!("rank {rank} entered a collective twice"),
            });
        }
        st.slots[rank] = Some(contribution);
        st.arrived += 1;

        if st.arrived == self.world_size {
            let all: Option<Vec<HostTensor>> = st.slots.iter_mut().map(Option::take).collect();
            let all = all.ok_or_else(|| Error::DistributedError {
                reason: "collective completed with a missing contribution".to_string(),
            })?;
            st.result = Some(Arc::new(all));
            st.arrived = 0;
            st.draining = true;
            self.changed.notify_all();
        } else {
            while !st.draining {
                st = self.wait(st)?;
            }
        }

        let out = st.result.clone().ok_or_else(|| Error::DistributedError {
            reason: "collective result missing".to_string(),
        })?;
        st.departed += 1;
        if st.departed == self.world_size {
            st.departed = 0;
            st.draining = false;
            st.result = None;
            self.changed.notify_all();
        }
        Ok(out)
    }

    fn post(&self, src: usize, dst: usize, tag: u32, payload: HostTensor) -> Result<()> {
        let mut st = self.lock()?;
        st.mailbox.entry((src, dst, tag)).or_default().push_back(payload);
        self.changed.notify_all();
        Ok(())
    }

    fn take(&self, src: usize, dst: usize, tag: u32) -> Result<HostTensor> {
        let mut st = self.lock()?;
        loop {
            if let Some(msg) = st.mailbox.get_mut(&(src, dst, tag)).and_then(VecDeque::pop_front) {
                return Ok(msg);
            }
            st = self.wait(st)?;
        }
    }
}

/// One member's handle on a [`LocalHub`].
pub struct LocalGroup<R: Runtime> {
    hub: Arc<LocalHub>,
    rank: usize,
    device: R::Device,
    _runtime: PhantomData<fn() -> R>,
}

impl<R: Runtime> LocalGroup<R> {
    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.hub.world_size || peer == self.rank {
            return Err(Error::DistributedError {
                reason: format!(
                    "rank {} cannot exchange with peer {peer} in a group of {}",
                    self.rank, self.hub.world_size
                ),
            });
        }
        Ok(())
    }
}

impl<R> ProcessGroup<R> for LocalGroup<R>
where
    R: Runtime<DType = DType>,
    R::Device: Send + Sync,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    fn all_reduce(&self, tensor: Tensor<R>) -> Result<Tensor<R>> {
        if self.hub.world_size == 1 {
            return Ok(tensor);
        }
        let parts = self.hub.exchange(self.rank, HostTensor::from_tensor(&tensor)?)?;
        Ok(HostTensor::sum(&parts)?.to_tensor::<R>(&self.device))
    }

    fn broadcast(&self, tensor: Tensor<R>, root: usize) -> Result<Tensor<R>> {
        if root >= self.hub.world_size {
            return Err(Error::DistributedError {
                reason: format!("broadcast root {root} outside group of {}", self.hub.world_size),
            });
        }
        if self.hub.world_size == 1 {
            return Ok(tensor);
        }
        let parts = self.hub.exchange(self.rank, HostTensor::from_tensor(&tensor)?)?;
        Ok(parts[root].to_tensor::<R>(&self.device))
    }

    fn all_gather(&self, tensor: &Tensor<R>) -> Result<Vec<Tensor<R>>> {
        if self.hub.world_size == 1 {
            return Ok(vec![tensor.clone()]);
        }
        let parts = self.hub.exchange(self.rank, HostTensor::from_tensor(tensor)?)?;
        Ok(parts.iter().map(|p| p.to_tensor::<R>(&self.device)).collect())
    }

    fn send(&self, tensor: &Tensor<R>, dest: usize, tag: u32) -> Result<()> {
        self.check_peer(dest)?;
        self.hub
            .post(self.rank, dest, tag, HostTensor::from_tensor(tensor)?)
    }

    fn recv(&self, src: usize, tag: u32) -> Result<Tensor<R>> {
        self.check_peer(src)?;
        let msg = self.hub.take(src, self.rank, tag)?;
        Ok(msg.to_tensor::<R>(&self.device))
    }
}
