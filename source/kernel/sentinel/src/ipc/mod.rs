// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous two-party IPC rendezvous with an optional single-page grant
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: recv(), try_send(), IpcError, SendOutcome, RecvOutcome, SendQueue (queued-send)
//! DEPENDS_ON: env::EnvTable, mm::{grant_into, FramePool}
//! INVARIANTS: One pending message per receiver; a failed send changes no state;
//!             delivery (fields, grant, return value, status) happens in one step

mod queue;

use log::debug;

use crate::env::{EnvError, EnvStatus, EnvTable};
use crate::error::Errno;
use crate::mm::{self, FramePool, MapError, Perm, VmError};
use crate::types::{EnvId, UserVa};

pub use queue::{PendingSend, SendQueue};

/// Errors produced by the rendezvous operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target is not blocked in receive.
    NotReceiving,
    /// Lookup or page-grant failure.
    Vm(VmError),
}

impl IpcError {
    pub const fn errno(self) -> Errno {
        match self {
            Self::NotReceiving => Errno::IpcNotRecv,
            Self::Vm(err) => err.errno(),
        }
    }
}

impl From<VmError> for IpcError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<EnvError> for IpcError {
    fn from(value: EnvError) -> Self {
        Self::Vm(VmError::Env(value))
    }
}

impl From<MapError> for IpcError {
    fn from(value: MapError) -> Self {
        Self::Vm(VmError::Map(value))
    }
}

/// How a successful send completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The receiver got the message during this call.
    Delivered,
    /// The sender is parked until the receiver asks for a message (queued-send builds).
    Queued,
}

/// How a receive request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The caller is suspended until a sender completes the rendezvous.
    Waiting,
    /// A parked sender was matched and the message is already in place.
    Delivered,
}

/// Declares `caller` willing to receive, optionally with a page landing at `dstva`.
///
/// Rejects a misaligned `dstva` below the ceiling without touching any state.
pub fn recv(
    envs: &mut EnvTable,
    pool: &mut FramePool,
    queue: &mut SendQueue,
    caller: EnvId,
    dstva: usize,
) -> Result<RecvOutcome, IpcError> {
    let dstva = UserVa::grant(dstva).map_err(|()| MapError::Unaligned)?;
    let env = envs.live_mut(caller)?;
    env.ipc.dstva = dstva;

    if queue.deliver_pending(envs, pool, caller) {
        return Ok(RecvOutcome::Delivered);
    }

    let env = envs.live_mut(caller)?;
    env.ipc.recving = true;
    env.status = EnvStatus::NotRunnable;
    debug!(target: "ipc", "[{caller}] recv dstva={dstva:?}");
    Ok(RecvOutcome::Waiting)
}

/// Attempts to hand `value` (and the page at `srcva`, if any) to `target`.
///
/// Any environment may message any other. Without a waiting receiver nothing changes
/// and `NotReceiving` is returned (or, with queued sends, the sender is parked).
#[allow(clippy::too_many_arguments)]
pub fn try_send(
    envs: &mut EnvTable,
    pool: &mut FramePool,
    queue: &mut SendQueue,
    caller: EnvId,
    target: EnvId,
    value: u32,
    srcva: usize,
    perm: usize,
) -> Result<SendOutcome, IpcError> {
    let id = envs.resolve(caller, target, false)?;
    let waiting = id != caller && envs.get(id).is_some_and(|e| e.ipc.recving);
    if !waiting {
        if cfg!(feature = "queued-send") && id != caller {
            queue.park(envs, PendingSend { sender: caller, target: id, value, srcva, perm })?;
            return Ok(SendOutcome::Queued);
        }
        return Err(IpcError::NotReceiving);
    }
    deliver(envs, pool, caller, id, value, srcva, perm)?;
    Ok(SendOutcome::Delivered)
}

/// Completes a rendezvous from `sender` to `receiver`. Validation precedes every mutation.
pub(crate) fn deliver(
    envs: &mut EnvTable,
    pool: &mut FramePool,
    sender: EnvId,
    receiver: EnvId,
    value: u32,
    srcva: usize,
    perm: usize,
) -> Result<(), IpcError> {
    let (from, to) = envs.pair_mut(sender, receiver)?;
    let grant = match (UserVa::grant(srcva), to.ipc.dstva) {
        (Ok(Some(src)), Some(dst)) => Some((src, dst)),
        (Err(()), Some(_)) => return Err(MapError::Unaligned.into()),
        _ => None,
    };

    let mut granted = Perm::empty();
    if let Some((src, dst)) = grant {
        let perm = mm::check_perm(perm)?;
        let pte = from.space.lookup(src).ok_or(MapError::NotMapped)?;
        mm::grant_into(to, pool, pte, dst, perm)?;
        granted = perm;
    }

    to.ipc.recving = false;
    to.ipc.from = sender;
    to.ipc.value = value;
    to.ipc.perm = granted;
    to.tf.set_ret(0);
    to.status = EnvStatus::Runnable;
    debug!(target: "ipc", "[{sender}] -> {receiver} value={value:#x} perm={granted:?}");
    Ok(())
}
