// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context, Args, SysResult
//! DEPENDS_ON: env::EnvTable, mm::FramePool, ipc, net::NetDevice, sched::Scheduler
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; user buffers checked
//!             against the shadow table before the kernel touches them

use log::{debug, info, warn};

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_ENV_DESTROY, SYSCALL_ENV_SET_PGFAULT_UPCALL,
    SYSCALL_ENV_SET_STATUS, SYSCALL_ENV_SET_TRAPFRAME, SYSCALL_EXEC, SYSCALL_EXOFORK,
    SYSCALL_GETENVID, SYSCALL_IPC_RECV, SYSCALL_IPC_TRY_SEND, SYSCALL_NET_GET_MACADDR,
    SYSCALL_NET_RECV, SYSCALL_NET_SEND, SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP,
    SYSCALL_PAGE_UNMAP, SYSCALL_SBRK, SYSCALL_YIELD,
};
use crate::env::{EnvError, EnvStatus, EnvTable, TrapFrame, TRAPFRAME_BYTES};
use crate::ipc::{self, RecvOutcome, SendOutcome, SendQueue};
use crate::mm::{self, FramePool, Perm};
use crate::net::{NetDevice, MAC_LEN};
use crate::sched::Scheduler;
use crate::types::{page_floor, EnvId, UserVa, PAGE_SIZE, UTEXT};

/// Kernel state a handler may touch, borrowed for one syscall.
pub struct Context<'a> {
    pub caller: EnvId,
    pub envs: &'a mut EnvTable,
    pub frames: &'a mut FramePool,
    pub sched: &'a mut Scheduler,
    pub nic: &'a mut dyn NetDevice,
    /// Initial program break for environments created by this call.
    pub heap_top: usize,
    /// Senders parked on receivers (always empty unless queued sends are enabled).
    pub queue: &'a mut SendQueue,
}

impl Context<'_> {
    /// Tears down `id`. Destroying the caller only marks it; the entry path reaps it.
    pub fn destroy(&mut self, id: EnvId) -> SysResult<()> {
        self.queue.purge(self.envs, id);
        if id == self.caller {
            self.envs.live_mut(id)?.status = EnvStatus::Dying;
            return Ok(());
        }
        self.envs.free(id, self.frames)?;
        Ok(())
    }

    /// Destroys the caller if `[va, va + len)` is not accessible with `perm`.
    fn user_mem_assert(&mut self, va: usize, len: usize, perm: Perm) -> SysResult<()> {
        let env = self.envs.get(self.caller).ok_or(EnvError::BadEnv)?;
        if let Err(bad) = mm::user_mem_check(env, va, len, perm) {
            warn!(
                target: "syscall",
                "[{}] user_mem_check assertion failure for va {bad:#010x}",
                self.caller
            );
            self.destroy(self.caller)?;
            return Err(Error::TaskExit);
        }
        Ok(())
    }
}

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    target: EnvId,
    va: UserVa,
    perm: Perm,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: EnvId::from(args.get(0)),
            va: mm::check_va(args.get(1))?,
            perm: mm::check_perm(args.get(2))?,
        })
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: EnvId,
    srcva: UserVa,
    dst: EnvId,
    dstva: UserVa,
    perm: Perm,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: EnvId::from(args.get(0)),
            srcva: mm::check_va(args.get(1))?,
            dst: EnvId::from(args.get(2)),
            dstva: mm::check_va(args.get(3))?,
            perm: mm::check_perm(args.get(4))?,
        })
    }
}

#[derive(Copy, Clone)]
struct PageUnmapArgsTyped {
    target: EnvId,
    va: UserVa,
}

impl PageUnmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { target: EnvId::from(args.get(0)), va: mm::check_va(args.get(1))? })
    }
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    target: EnvId,
    status: Option<EnvStatus>,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { target: EnvId::from(args.get(0)), status: EnvStatus::from_user(args.get(1)) })
    }

    #[inline]
    fn check(&self) -> Result<EnvStatus, Error> {
        self.status.ok_or(Error::InvalidArgs)
    }
}

#[derive(Copy, Clone)]
struct TrySendArgsTyped {
    target: EnvId,
    value: u32,
    srcva: usize,
    perm: usize,
}

impl TrySendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: EnvId::from(args.get(0)),
            value: args.get(1) as u32,
            srcva: args.get(2),
            perm: args.get(3),
        })
    }
}

/// A user buffer named by pointer and length.
#[derive(Copy, Clone)]
struct UserBufArgsTyped {
    ptr: usize,
    len: usize,
}

impl UserBufArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { ptr: args.get(0), len: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.ptr == 0 {
            return Err(Error::InvalidArgs);
        }
        self.ptr.checked_add(self.len).ok_or(Error::InvalidArgs)?;
        Ok(())
    }
}

/// Installs all handlers into `table`.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_GETENVID, sys_getenvid);
    table.register(SYSCALL_ENV_DESTROY, sys_env_destroy);
    table.register(SYSCALL_PAGE_ALLOC, sys_page_alloc);
    table.register(SYSCALL_PAGE_MAP, sys_page_map);
    table.register(SYSCALL_PAGE_UNMAP, sys_page_unmap);
    table.register(SYSCALL_EXOFORK, sys_exofork);
    table.register(SYSCALL_ENV_SET_STATUS, sys_env_set_status);
    table.register(SYSCALL_ENV_SET_TRAPFRAME, sys_env_set_trapframe);
    table.register(SYSCALL_ENV_SET_PGFAULT_UPCALL, sys_env_set_pgfault_upcall);
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_IPC_TRY_SEND, sys_ipc_try_send);
    table.register(SYSCALL_IPC_RECV, sys_ipc_recv);
    table.register(SYSCALL_SBRK, sys_sbrk);
    table.register(SYSCALL_NET_SEND, sys_net_send);
    table.register(SYSCALL_NET_RECV, sys_net_recv);
    table.register(SYSCALL_NET_GET_MACADDR, sys_net_get_macaddr);
    table.register(SYSCALL_EXEC, sys_exec);
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(usize::from(ctx.caller))
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.envs.resolve(ctx.caller, EnvId::from(args.get(0)), true)?;
    if id == ctx.caller {
        info!(target: "env", "[{id}] exiting gracefully");
    } else {
        info!(target: "env", "[{}] destroying {id}", ctx.caller);
    }
    ctx.destroy(id)?;
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageAllocArgsTyped::decode(args)?;
    mm::page_alloc(ctx.envs, ctx.frames, ctx.caller, typed.target, typed.va, typed.perm)?;
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args)?;
    mm::map_between(
        ctx.envs,
        ctx.frames,
        ctx.caller,
        typed.src,
        typed.srcva,
        typed.dst,
        typed.dstva,
        typed.perm,
    )?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageUnmapArgsTyped::decode(args)?;
    mm::page_unmap(ctx.envs, ctx.frames, ctx.caller, typed.target, typed.va)?;
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let parent = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnv)?;
    let (tf, brk) = (parent.tf, parent.brk);
    let child = ctx.envs.alloc(ctx.caller, ctx.heap_top)?;
    let env = ctx.envs.live_mut(child)?;
    env.status = EnvStatus::NotRunnable;
    env.tf = tf;
    env.tf.set_ret(0);
    env.brk = brk;
    debug!(target: "syscall", "[{}] exofork -> {child}", ctx.caller);
    Ok(usize::from(child))
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetStatusArgsTyped::decode(args)?;
    let id = ctx.envs.resolve(ctx.caller, typed.target, true)?;
    let status = typed.check()?;
    ctx.envs.live_mut(id)?.status = status;
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.envs.resolve(ctx.caller, EnvId::from(args.get(0)), true)?;
    let ptr = args.get(1);
    ctx.user_mem_assert(ptr, TRAPFRAME_BYTES, Perm::empty())?;
    let mut raw = [0u8; TRAPFRAME_BYTES];
    let caller = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnv)?;
    mm::copy_from_user(caller, ctx.frames, ptr, &mut raw).map_err(|_| Error::InvalidArgs)?;
    let mut tf = TrapFrame::from_bytes(&raw);
    tf.sanitize();
    ctx.envs.live_mut(id)?.tf = tf;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.envs.resolve(ctx.caller, EnvId::from(args.get(0)), true)?;
    let entry = args.get(1);
    ctx.envs.live_mut(id)?.pgfault_upcall = (entry != 0).then_some(entry);
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let next = ctx.sched.pick_next(ctx.envs);
    debug!(target: "syscall", "[{}] yield -> {next:?}", ctx.caller);
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = TrySendArgsTyped::decode(args)?;
    let outcome = ipc::try_send(
        ctx.envs,
        ctx.frames,
        ctx.queue,
        ctx.caller,
        typed.target,
        typed.value,
        typed.srcva,
        typed.perm,
    )?;
    match outcome {
        SendOutcome::Delivered => Ok(0),
        SendOutcome::Queued => Err(Error::Blocked),
    }
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let outcome = ipc::recv(ctx.envs, ctx.frames, ctx.queue, ctx.caller, args.get(0))?;
    match outcome {
        RecvOutcome::Waiting => {
            ctx.sched.pick_next(ctx.envs);
            Err(Error::Blocked)
        }
        RecvOutcome::Delivered => Ok(0),
    }
}

fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let inc = args.get(0);
    let caller = ctx.caller;
    let env = ctx.envs.live_mut(caller)?;
    let brk = env.brk;
    let low = brk.checked_sub(inc).ok_or(Error::InvalidArgs)?;
    let new_brk = page_floor(low);
    if new_brk < UTEXT {
        return Err(Error::InvalidArgs);
    }
    let mut added = Vec::new();
    for page in (new_brk..brk).step_by(PAGE_SIZE) {
        let va = mm::check_va(page)?;
        if env.space.lookup(va).is_some() {
            continue;
        }
        let inserted = ctx
            .frames
            .alloc(true)
            .and_then(|frame| env.space.insert(ctx.frames, va, frame, Perm::PUW));
        if let Err(err) = inserted {
            for va in added {
                env.space.remove(ctx.frames, va);
            }
            return Err(err.into());
        }
        added.push(va);
    }
    env.brk = new_brk;
    debug!(target: "syscall", "[{caller}] sbrk {inc:#x} -> {new_brk:#010x}");
    Ok(new_brk)
}

fn sys_net_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UserBufArgsTyped::decode(args)?;
    typed.check()?;
    ctx.user_mem_assert(typed.ptr, typed.len, Perm::PUW)?;
    let env = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnv)?;
    let mut frame = vec![0u8; typed.len];
    mm::copy_from_user(env, ctx.frames, typed.ptr, &mut frame).map_err(|_| Error::InvalidArgs)?;
    ctx.nic.transmit(&frame)?;
    Ok(0)
}

fn sys_net_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UserBufArgsTyped::decode(args)?;
    typed.check()?;
    ctx.user_mem_assert(typed.ptr, typed.len, Perm::PUW)?;
    let mut frame = vec![0u8; typed.len];
    let n = ctx.nic.receive(&mut frame)?;
    let env = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnv)?;
    mm::copy_to_user(env, ctx.frames, typed.ptr, &frame[..n]).map_err(|_| Error::InvalidArgs)?;
    Ok(n)
}

fn sys_net_get_macaddr(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let ptr = args.get(0);
    ctx.user_mem_assert(ptr, MAC_LEN, Perm::W)?;
    let mac = ctx.nic.mac_address();
    let env = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnv)?;
    mm::copy_to_user(env, ctx.frames, ptr, &mac).map_err(|_| Error::InvalidArgs)?;
    Ok(0)
}

fn sys_exec(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let child = ctx.envs.resolve(ctx.caller, EnvId::from(args.get(0)), true)?;
    if child == ctx.caller {
        return Err(Error::InvalidArgs);
    }
    let (me, image) = ctx.envs.pair_mut(ctx.caller, child)?;
    core::mem::swap(&mut me.space, &mut image.space);
    me.tf = image.tf;
    me.brk = image.brk;
    me.pgfault_upcall = image.pgfault_upcall;
    info!(target: "syscall", "[{}] exec image of {child}", ctx.caller);
    // The child now owns the old image and takes it down with it.
    ctx.destroy(child)?;
    Err(Error::Reschedule)
}
