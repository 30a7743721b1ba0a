// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel entry points: syscall trap, page-fault trap, and user memory access
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; multi-environment scenarios in tests/sentinel_e2e
//! PUBLIC API: Kernel, SyscallOutcome, FaultDisposition, AccessError
//! DEPENDS_ON: syscall::SyscallTable, env::EnvTable, mm::FramePool, net::NetDevice
//! INVARIANTS: A syscall result reaches the return register exactly once, either here or
//!             from whichever party completes a blocked operation; dying callers never resume

use log::{debug, info, warn};

use crate::config::{ConfigError, KernelConfig};
use crate::env::{Env, EnvError, EnvStatus, EnvTable, UTrapframe, UTRAPFRAME_BYTES};
use crate::error::Errno;
use crate::ipc::SendQueue;
use crate::mm::{self, FramePool, PageFault, Perm, Pte, VmError};
use crate::net::{LoopbackNic, NetDevice};
use crate::sched::Scheduler;
use crate::syscall::{api, Args, Error, SyscallTable};
use crate::types::{page_floor, EnvId, UserVa, PAGE_SIZE, USTACKTOP, UTEXT, UXSTACKTOP};

/// What the trap path does with the caller after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Value written to the caller's return register; the caller continues.
    Return(isize),
    /// Caller is suspended; its return register is written by whoever wakes it.
    Blocked,
    /// Caller's context was replaced; resume it as saved.
    Resume,
    /// Caller was destroyed.
    Exited,
}

/// Result of reflecting a user page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Record pushed on the exception stack; run `entry` with it.
    Upcall { entry: usize, utf: UTrapframe },
    /// No usable handler; the environment is gone.
    Destroyed,
}

/// Failure of a user-mode memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    Env(EnvError),
    Fault(PageFault),
}

impl From<EnvError> for AccessError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<PageFault> for AccessError {
    fn from(value: PageFault) -> Self {
        Self::Fault(value)
    }
}

pub struct Kernel {
    config: KernelConfig,
    envs: EnvTable,
    frames: FramePool,
    sched: Scheduler,
    nic: Box<dyn NetDevice>,
    table: SyscallTable,
    queue: SendQueue,
}

impl Kernel {
    /// Boots a kernel with a loopback NIC.
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        let nic = Box::new(LoopbackNic::new(config.nic_ring));
        Self::with_nic(config, nic)
    }

    pub fn with_nic(config: KernelConfig, nic: Box<dyn NetDevice>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut table = SyscallTable::new();
        api::install_handlers(&mut table);
        info!(
            target: "env",
            "kernel up: {} env slots, {} frames, heap top {:#010x}",
            config.max_envs, config.frames, config.heap_top
        );
        Ok(Self {
            envs: EnvTable::new(config.max_envs),
            frames: FramePool::new(config.frames),
            sched: Scheduler::new(),
            nic,
            table,
            queue: SendQueue::new(config.send_queue_capacity),
            config,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Creates a runnable environment with a one-page user stack, entering at `UTEXT`.
    pub fn create_env(&mut self, parent: EnvId) -> Result<EnvId, VmError> {
        let id = self.envs.alloc(parent, self.config.heap_top)?;
        if let Err(err) = self.map_stack(id) {
            let _ = self.envs.free(id, &mut self.frames);
            return Err(err);
        }
        Ok(id)
    }

    fn map_stack(&mut self, id: EnvId) -> Result<(), VmError> {
        let env = self.envs.live_mut(id)?;
        let va = mm::check_va(USTACKTOP - PAGE_SIZE)?;
        let frame = self.frames.alloc(true)?;
        env.space.insert(&mut self.frames, va, frame, Perm::PUW)?;
        env.tf.sp = USTACKTOP;
        env.tf.pc = UTEXT;
        env.tf.sanitize();
        Ok(())
    }

    /// Trap entry for `caller` invoking syscall `number`.
    pub fn syscall(&mut self, caller: EnvId, number: usize, args: &Args) -> SyscallOutcome {
        if self.envs.get(caller).is_none() {
            return SyscallOutcome::Exited;
        }
        self.sched.enter(caller);
        let mut ctx = api::Context {
            caller,
            envs: &mut self.envs,
            frames: &mut self.frames,
            sched: &mut self.sched,
            nic: self.nic.as_mut(),
            heap_top: self.config.heap_top,
            queue: &mut self.queue,
        };
        let result = self.table.dispatch(number, &mut ctx, args);

        if self.envs.get(caller).is_some_and(|e| e.status == EnvStatus::Dying) {
            self.reap(caller);
            return SyscallOutcome::Exited;
        }
        let value = match result {
            Ok(value) => value as isize,
            Err(Error::Blocked) => return SyscallOutcome::Blocked,
            Err(Error::Reschedule) => return SyscallOutcome::Resume,
            Err(Error::TaskExit) => return SyscallOutcome::Exited,
            Err(err) => {
                debug!(target: "syscall", "[{caller}] syscall {number} failed: {err}");
                err.errno().unwrap_or(Errno::Unspecified).code()
            }
        };
        if let Some(env) = self.envs.get_mut(caller) {
            env.tf.set_ret(value as usize);
        }
        SyscallOutcome::Return(value)
    }

    fn reap(&mut self, id: EnvId) {
        if self.destroy_env(id).is_ok() {
            info!(target: "env", "[{id}] reaped");
        }
    }

    /// Destroys `id` from outside any syscall (fatal fault, harness teardown).
    pub fn destroy_env(&mut self, id: EnvId) -> Result<(), EnvError> {
        self.queue.purge(&mut self.envs, id);
        self.envs.free(id, &mut self.frames)
    }

    /// Reflects a user page fault to the environment's upcall on its exception stack.
    ///
    /// Without an upcall, or without a writable exception stack, the environment is destroyed.
    pub fn page_fault(
        &mut self,
        id: EnvId,
        fault: PageFault,
    ) -> Result<FaultDisposition, EnvError> {
        let env = self.envs.get(id).ok_or(EnvError::BadEnv)?;
        match Self::push_utrapframe(env, &mut self.frames, fault) {
            Some((entry, utf)) => {
                if let Some(env) = self.envs.get_mut(id) {
                    env.last_fault = Some(utf);
                }
                debug!(target: "fault", "[{id}] fault va {:#010x} -> upcall {entry:#x}", fault.va);
                Ok(FaultDisposition::Upcall { entry, utf })
            }
            None => {
                warn!(
                    target: "fault",
                    "[{id}] user fault va {:#010x} code {:?} pc {:#x}",
                    fault.va, fault.code, env.tf.pc
                );
                self.destroy_env(id)?;
                Ok(FaultDisposition::Destroyed)
            }
        }
    }

    fn push_utrapframe(
        env: &Env,
        frames: &mut FramePool,
        fault: PageFault,
    ) -> Option<(usize, UTrapframe)> {
        let entry = env.pgfault_upcall?;
        let xstack = UserVa::page_aligned(UXSTACKTOP - PAGE_SIZE)?;
        let pte = env.space.lookup(xstack)?;
        if !pte.perm.contains(Perm::PUW) {
            return None;
        }
        // A fault inside the handler stacks below the active record, one scratch word apart.
        let top = if page_floor(env.tf.sp) == xstack.raw() { env.tf.sp - 8 } else { UXSTACKTOP };
        let base = top.checked_sub(UTRAPFRAME_BYTES).filter(|b| *b >= xstack.raw())?;
        let utf = UTrapframe::new(fault.va, fault.code, &env.tf);
        mm::copy_to_user(env, frames, base, &utf.to_bytes()).ok()?;
        Some((entry, utf))
    }

    /// User-mode load by `id`, checked against its user table.
    pub fn user_read(&self, id: EnvId, va: usize, buf: &mut [u8]) -> Result<(), AccessError> {
        let env = self.envs.get(id).ok_or(EnvError::BadEnv)?;
        mm::mmu_read(&env.space, &self.frames, va, buf)?;
        Ok(())
    }

    /// User-mode store by `id`; nothing is written unless every page permits it.
    pub fn user_write(&mut self, id: EnvId, va: usize, data: &[u8]) -> Result<(), AccessError> {
        let env = self.envs.get(id).ok_or(EnvError::BadEnv)?;
        mm::mmu_write(&env.space, &mut self.frames, va, data)?;
        Ok(())
    }

    /// Read-only view of `id`'s user table at the page containing `va`.
    pub fn lookup(&self, id: EnvId, va: usize) -> Option<Pte> {
        let va = UserVa::page_aligned(page_floor(va))?;
        self.envs.get(id)?.space.lookup(va)
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id)
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FramePool {
        &mut self.frames
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Environments parked in a queued send.
    pub fn queued_sends(&self) -> usize {
        self.queue.len()
    }
}
