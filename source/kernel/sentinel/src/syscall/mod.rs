// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs
//! DEPENDS_ON: env, ipc, mm, net, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline

pub mod api;

use core::fmt;

use crate::error::Errno;
use crate::{env, ipc, mm, net};

/// Maximum number of syscalls supported by the table.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_GETENVID: usize = 0;
pub const SYSCALL_ENV_DESTROY: usize = 1;
pub const SYSCALL_PAGE_ALLOC: usize = 2;
pub const SYSCALL_PAGE_MAP: usize = 3;
pub const SYSCALL_PAGE_UNMAP: usize = 4;
/// Creates a non-runnable child whose saved context returns 0 from this call.
pub const SYSCALL_EXOFORK: usize = 5;
pub const SYSCALL_ENV_SET_STATUS: usize = 6;
pub const SYSCALL_ENV_SET_TRAPFRAME: usize = 7;
pub const SYSCALL_ENV_SET_PGFAULT_UPCALL: usize = 8;
pub const SYSCALL_YIELD: usize = 9;
pub const SYSCALL_IPC_TRY_SEND: usize = 10;
/// Blocks the caller; the matching sender writes its return value.
pub const SYSCALL_IPC_RECV: usize = 11;
pub const SYSCALL_SBRK: usize = 12;
pub const SYSCALL_NET_SEND: usize = 13;
pub const SYSCALL_NET_RECV: usize = 14;
pub const SYSCALL_NET_GET_MACADDR: usize = 15;
/// Replaces the caller's image with a prepared child's; does not return on success.
pub const SYSCALL_EXEC: usize = 16;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Argument outside the accepted domain (status value, heap growth, ...).
    InvalidArgs,
    /// Environment lookup or allocation failed.
    Env(env::EnvError),
    /// Mapping primitive failed.
    Vm(mm::VmError),
    /// Rendezvous failed.
    Ipc(ipc::IpcError),
    /// Device leaf failed.
    Net(net::NetError),
    /// Caller is suspended; whoever completes the operation writes its return value.
    Blocked,
    /// Caller's saved context was replaced wholesale; resume it without writing a result.
    Reschedule,
    /// Current environment was destroyed and must not resume.
    TaskExit,
}

impl Error {
    /// Error number reported to the caller; `None` for control-flow outcomes.
    pub fn errno(self) -> Option<Errno> {
        match self {
            Self::InvalidSyscall | Self::InvalidArgs => Some(Errno::Inval),
            Self::Env(err) => Some(err.errno()),
            Self::Vm(err) => Some(err.errno()),
            Self::Ipc(err) => Some(err.errno()),
            Self::Net(err) => Some(err.errno()),
            Self::Blocked | Self::Reschedule | Self::TaskExit => None,
        }
    }
}

impl From<env::EnvError> for Error {
    fn from(value: env::EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<mm::VmError> for Error {
    fn from(value: mm::VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<mm::MapError> for Error {
    fn from(value: mm::MapError) -> Self {
        Self::Vm(mm::VmError::Map(value))
    }
}

impl From<ipc::IpcError> for Error {
    fn from(value: ipc::IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl From<net::NetError> for Error {
    fn from(value: net::NetError) -> Self {
        Self::Net(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno() {
            Some(errno) => write!(f, "{errno} ({self:?})"),
            None => write!(f, "{self:?}"),
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}
