// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host machine wrapping the kernel, and per-environment syscall stubs
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Machine::new()/spawn()/handle()/with_kernel()
//!   - Env: syscall wrappers, read()/write() through the user MMU, uvpt()
//!
//! SECURITY INVARIANTS:
//!   - User code only reaches kernel state through numbered syscalls
//!   - Memory access is checked against the environment's user table, never the shadow
//!   - A blocked caller resumes only after the kernel marks it runnable again
//!
//! DEPENDENCIES:
//!   - parking_lot::{Mutex, Condvar}: serialises kernel entry, wakes blocked callers

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use sentinel::env::IpcState;
use sentinel::syscall::{
    SYSCALL_ENV_DESTROY, SYSCALL_ENV_SET_PGFAULT_UPCALL, SYSCALL_ENV_SET_STATUS,
    SYSCALL_ENV_SET_TRAPFRAME, SYSCALL_EXEC, SYSCALL_EXOFORK, SYSCALL_GETENVID,
    SYSCALL_IPC_RECV, SYSCALL_IPC_TRY_SEND, SYSCALL_NET_GET_MACADDR, SYSCALL_NET_RECV,
    SYSCALL_NET_SEND, SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP, SYSCALL_PAGE_UNMAP, SYSCALL_SBRK,
    SYSCALL_YIELD,
};
use sentinel::{
    AccessError, Args, ConfigError, EnvId, EnvStatus, Errno, FaultDisposition, Kernel,
    KernelConfig, PageFault, Perm, Pte, SyscallOutcome,
};

use crate::pgfault::PgfaultHandler;
use crate::{Result, RtError};

/// Upcall entry addresses handed to the kernel; each one names a registered handler.
const UPCALL_BASE: usize = 0x00f0_0000;
const UPCALL_STRIDE: usize = 0x10;

/// A kernel instance shared by every environment thread.
pub struct Machine {
    kernel: Mutex<Kernel>,
    wake: Condvar,
    upcalls: Mutex<Vec<PgfaultHandler>>,
}

impl Machine {
    /// Boots a kernel with `config`.
    pub fn new(config: KernelConfig) -> core::result::Result<Arc<Self>, ConfigError> {
        Ok(Arc::new(Self::from_kernel(Kernel::new(config)?)))
    }

    /// Wraps an already booted kernel.
    pub fn from_kernel(kernel: Kernel) -> Self {
        Self { kernel: Mutex::new(kernel), wake: Condvar::new(), upcalls: Mutex::new(Vec::new()) }
    }

    /// Creates a fresh top-level environment.
    pub fn spawn(self: &Arc<Self>) -> Result<Env> {
        let id = self.with_kernel(|k| k.create_env(EnvId::SELF)).map_err(|e| e.errno())?;
        Ok(self.handle(id))
    }

    /// Handle for an existing environment.
    pub fn handle(self: &Arc<Self>, id: EnvId) -> Env {
        Env { machine: Arc::clone(self), id }
    }

    /// Runs `f` with the kernel locked, then wakes every blocked caller.
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut kernel = self.kernel.lock();
        let out = f(&mut kernel);
        self.wake.notify_all();
        out
    }

    fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock()
    }

    pub(crate) fn register_upcall(&self, handler: PgfaultHandler) -> usize {
        let mut upcalls = self.upcalls.lock();
        let index = match upcalls.iter().position(|h| *h as usize == handler as usize) {
            Some(index) => index,
            None => {
                upcalls.push(handler);
                upcalls.len() - 1
            }
        };
        UPCALL_BASE + index * UPCALL_STRIDE
    }

    fn upcall(&self, entry: usize) -> Option<PgfaultHandler> {
        let offset = entry.checked_sub(UPCALL_BASE)?;
        if offset % UPCALL_STRIDE != 0 {
            return None;
        }
        self.upcalls.lock().get(offset / UPCALL_STRIDE).copied()
    }

    fn syscall(&self, id: EnvId, number: usize, args: &Args) -> SyscallOutcome {
        self.with_kernel(|k| k.syscall(id, number, args))
    }

    /// Sleeps until `id` is runnable and returns what was left in its return register.
    fn wait_runnable(&self, id: EnvId) -> Result<isize> {
        let mut kernel = self.lock();
        loop {
            let state = kernel.env(id).map(|e| (e.status, e.tf.ret()));
            match state {
                None => return Err(RtError::Killed),
                Some((EnvStatus::Runnable, ret)) => return Ok(ret as isize),
                Some(_) => self.wake.wait(&mut kernel),
            }
        }
    }
}

/// One environment as seen from its own user code.
#[derive(Clone)]
pub struct Env {
    machine: Arc<Machine>,
    id: EnvId,
}

impl core::fmt::Debug for Env {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Env").field("id", &self.id).finish()
    }
}

impl Env {
    /// Identifier of this environment.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Machine the environment runs on.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    fn syscall(&self, number: usize, regs: &[usize]) -> Result<usize> {
        let mut raw = [0usize; 6];
        raw[..regs.len()].copy_from_slice(regs);
        let ret = match self.machine.syscall(self.id, number, &Args::new(raw)) {
            SyscallOutcome::Return(value) => value,
            SyscallOutcome::Blocked => self.machine.wait_runnable(self.id)?,
            SyscallOutcome::Resume => 0,
            SyscallOutcome::Exited => return Err(RtError::Killed),
        };
        match Errno::from_code(ret) {
            Some(errno) => Err(errno.into()),
            None => Ok(ret as usize),
        }
    }

    /// Identifier as reported by the kernel.
    pub fn getenvid(&self) -> Result<EnvId> {
        self.syscall(SYSCALL_GETENVID, &[]).map(EnvId::from)
    }

    /// Destroys `id` (or the caller for `EnvId::SELF`).
    pub fn env_destroy(&self, id: EnvId) -> Result<()> {
        self.syscall(SYSCALL_ENV_DESTROY, &[usize::from(id)]).map(drop)
    }

    /// Maps a fresh zeroed page at `va` in `id`.
    pub fn page_alloc(&self, id: EnvId, va: usize, perm: Perm) -> Result<()> {
        self.syscall(SYSCALL_PAGE_ALLOC, &[usize::from(id), va, perm.bits()]).map(drop)
    }

    /// Maps `src`'s page at `srcva` into `dst` at `dstva`.
    pub fn page_map(
        &self,
        src: EnvId,
        srcva: usize,
        dst: EnvId,
        dstva: usize,
        perm: Perm,
    ) -> Result<()> {
        self.syscall(SYSCALL_PAGE_MAP, &[usize::from(src), srcva, usize::from(dst), dstva, perm.bits()])
            .map(drop)
    }

    pub fn page_unmap(&self, id: EnvId, va: usize) -> Result<()> {
        self.syscall(SYSCALL_PAGE_UNMAP, &[usize::from(id), va]).map(drop)
    }

    /// Creates a blank child; the child is not runnable until its parent says so.
    pub fn exofork(&self) -> Result<EnvId> {
        self.syscall(SYSCALL_EXOFORK, &[]).map(EnvId::from)
    }

    pub fn env_set_status(&self, id: EnvId, status: EnvStatus) -> Result<()> {
        self.syscall(SYSCALL_ENV_SET_STATUS, &[usize::from(id), status.as_user()]).map(drop)
    }

    /// Installs the trap frame serialized at user address `ptr` into `id`.
    pub fn env_set_trapframe(&self, id: EnvId, ptr: usize) -> Result<()> {
        self.syscall(SYSCALL_ENV_SET_TRAPFRAME, &[usize::from(id), ptr]).map(drop)
    }

    pub fn env_set_pgfault_upcall(&self, id: EnvId, entry: usize) -> Result<()> {
        self.syscall(SYSCALL_ENV_SET_PGFAULT_UPCALL, &[usize::from(id), entry]).map(drop)
    }

    pub fn sys_yield(&self) -> Result<()> {
        self.syscall(SYSCALL_YIELD, &[]).map(drop)
    }

    /// One delivery attempt; `srcva >= UTOP` sends no page.
    pub fn ipc_try_send(&self, to: EnvId, value: u32, srcva: usize, perm: Perm) -> Result<()> {
        self.syscall(SYSCALL_IPC_TRY_SEND, &[usize::from(to), value as usize, srcva, perm.bits()])
            .map(drop)
    }

    /// Blocks until a message arrives; `dstva >= UTOP` accepts no page.
    pub fn ipc_recv_raw(&self, dstva: usize) -> Result<()> {
        self.syscall(SYSCALL_IPC_RECV, &[dstva]).map(drop)
    }

    /// Grows the heap by `inc` bytes and returns the new break.
    pub fn sbrk(&self, inc: usize) -> Result<usize> {
        self.syscall(SYSCALL_SBRK, &[inc])
    }

    pub fn net_send(&self, ptr: usize, len: usize) -> Result<()> {
        self.syscall(SYSCALL_NET_SEND, &[ptr, len]).map(drop)
    }

    /// Returns the received frame length.
    pub fn net_recv(&self, ptr: usize, len: usize) -> Result<usize> {
        self.syscall(SYSCALL_NET_RECV, &[ptr, len])
    }

    pub fn net_get_macaddr(&self, ptr: usize) -> Result<()> {
        self.syscall(SYSCALL_NET_GET_MACADDR, &[ptr]).map(drop)
    }

    /// Takes over `child`'s image; the caller continues in the adopted context.
    pub fn exec(&self, child: EnvId) -> Result<()> {
        self.syscall(SYSCALL_EXEC, &[usize::from(child)]).map(drop)
    }

    /// Loads `buf.len()` bytes at `va`, running the fault upcall as needed.
    pub fn read(&self, va: usize, buf: &mut [u8]) -> Result<()> {
        self.access(|k| k.user_read(self.id, va, buf))
    }

    /// Stores `data` at `va`, running the fault upcall as needed.
    pub fn write(&self, va: usize, data: &[u8]) -> Result<()> {
        self.access(|k| k.user_write(self.id, va, data))
    }

    pub fn read_u32(&self, va: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&self, va: usize, value: u32) -> Result<()> {
        self.write(va, &value.to_le_bytes())
    }

    fn access(
        &self,
        mut op: impl FnMut(&mut Kernel) -> core::result::Result<(), AccessError>,
    ) -> Result<()> {
        let mut last = None;
        loop {
            let result = op(&mut self.machine.lock());
            match result {
                Ok(()) => return Ok(()),
                Err(AccessError::Env(_)) => return Err(RtError::Killed),
                Err(AccessError::Fault(fault)) if last == Some(fault) => {
                    return Err(RtError::Unresolved { va: fault.va });
                }
                Err(AccessError::Fault(fault)) => {
                    self.handle_fault(fault)?;
                    last = Some(fault);
                }
            }
        }
    }

    fn handle_fault(&self, fault: PageFault) -> Result<()> {
        let disposition = self
            .machine
            .with_kernel(|k| k.page_fault(self.id, fault))
            .map_err(|_| RtError::Killed)?;
        let (entry, utf) = match disposition {
            FaultDisposition::Destroyed => return Err(RtError::Killed),
            FaultDisposition::Upcall { entry, utf } => (entry, utf),
        };
        debug!(target: "rt", "[{}] upcall {entry:#x} for va {:#010x}", self.id, utf.fault_va);
        let outcome = match self.machine.upcall(entry) {
            Some(handler) => handler(self, &utf),
            None => Err(RtError::Killed),
        };
        if let Err(err) = outcome {
            warn!(target: "rt", "[{}] fault handler failed: {err}", self.id);
            let _ = self.env_destroy(EnvId::SELF);
            return Err(err);
        }
        Ok(())
    }

    /// The read-only page-table window: mapping of the page containing `va`.
    pub fn uvpt(&self, va: usize) -> Option<Pte> {
        self.machine.lock().lookup(self.id, va)
    }

    /// Every mapping below `UTOP`, in ascending address order.
    pub fn mapped_pages(&self) -> Vec<(usize, Pte)> {
        let kernel = self.machine.lock();
        kernel.env(self.id).map(|e| e.space.mappings().collect()).unwrap_or_default()
    }

    /// Current status, `None` once the environment is gone.
    pub fn status(&self) -> Option<EnvStatus> {
        self.machine.lock().env(self.id).map(|e| e.status)
    }

    /// Registered fault upcall entry, if any.
    pub fn pgfault_upcall(&self) -> Option<usize> {
        self.machine.lock().env(self.id).and_then(|e| e.pgfault_upcall)
    }

    /// IPC fields from the last delivery.
    pub fn ipc_state(&self) -> Option<IpcState> {
        self.machine.lock().env(self.id).map(|e| e.ipc)
    }

    /// Starts running `child` on the calling thread once its parent marks it runnable.
    ///
    /// Only a freshly forked child qualifies: its saved return register must read 0.
    pub fn adopt(&self, child: EnvId) -> Result<Env> {
        match self.machine.wait_runnable(child)? {
            0 => Ok(self.machine.handle(child)),
            _ => Err(Errno::Inval.into()),
        }
    }
}
