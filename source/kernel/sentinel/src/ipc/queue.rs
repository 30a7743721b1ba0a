// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of senders parked on a receiver that was not yet waiting.
//!
//! A parked send is only ever completed from inside the receiver's own `recv` call, which
//! consumes it before the receiver becomes visible as receiving. No second sender can
//! observe the receiver in between and overwrite the delivery.

use std::collections::VecDeque;

use log::{debug, warn};

use super::{deliver, IpcError};
use crate::env::{EnvStatus, EnvTable};
use crate::error::Errno;
use crate::mm::FramePool;
use crate::types::EnvId;

/// Send arguments captured when the sender was parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSend {
    pub sender: EnvId,
    pub target: EnvId,
    pub value: u32,
    pub srcva: usize,
    pub perm: usize,
}

pub struct SendQueue {
    entries: VecDeque<PendingSend>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parks `send.sender` until `send.target` receives. A full queue refuses the send.
    pub(crate) fn park(&mut self, envs: &mut EnvTable, send: PendingSend) -> Result<(), IpcError> {
        if self.entries.len() >= self.capacity {
            warn!(target: "ipc", "send queue full, {} -> {} refused", send.sender, send.target);
            return Err(IpcError::NotReceiving);
        }
        envs.live_mut(send.sender)?.status = EnvStatus::NotRunnable;
        self.entries.push_back(send);
        debug!(target: "ipc", "[{}] parked send to {}", send.sender, send.target);
        Ok(())
    }

    /// Completes the oldest parked send addressed to `receiver`, if one validates.
    ///
    /// Sends that fail validation resume their sender with the error and are dropped.
    pub(crate) fn deliver_pending(
        &mut self,
        envs: &mut EnvTable,
        pool: &mut FramePool,
        receiver: EnvId,
    ) -> bool {
        while let Some(pos) = self.entries.iter().position(|p| p.target == receiver) {
            let Some(send) = self.entries.remove(pos) else {
                break;
            };
            let result = deliver(envs, pool, send.sender, receiver, send.value, send.srcva, send.perm);
            let code = match result {
                Ok(()) => 0,
                Err(err) => err.errno().code(),
            };
            if let Some(sender) = envs.get_mut(send.sender) {
                sender.tf.set_ret(code as usize);
                sender.status = EnvStatus::Runnable;
            }
            if result.is_ok() {
                return true;
            }
        }
        false
    }

    /// Forgets sends involving a destroyed environment.
    ///
    /// Senders parked on it resume with no-such-environment.
    pub(crate) fn purge(&mut self, envs: &mut EnvTable, gone: EnvId) {
        self.entries.retain(|p| {
            if p.sender == gone {
                return false;
            }
            if p.target == gone {
                if let Some(sender) = envs.get_mut(p.sender) {
                    sender.tf.set_ret(Errno::BadEnv.code() as usize);
                    sender.status = EnvStatus::Runnable;
                }
                return false;
            }
            true
        });
    }
}
