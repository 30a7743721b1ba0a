// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-visible error taxonomy and its negative numeric encoding
//! OWNERS: @kernel-team
//! PUBLIC API: Errno, Errno::code(), Errno::from_code()
//! DEPENDS_ON: thiserror
//! INVARIANTS: Codes are stable ABI; every code is strictly negative

use thiserror::Error;

/// Error numbers returned to user environments as negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum Errno {
    #[error("unspecified error")]
    Unspecified = 1,
    #[error("no such environment")]
    BadEnv = 2,
    #[error("invalid argument")]
    Inval = 3,
    #[error("out of memory")]
    NoMem = 4,
    #[error("no free environment")]
    NoFreeEnv = 5,
    #[error("memory fault")]
    Fault = 6,
    #[error("recipient not waiting")]
    IpcNotRecv = 7,
    #[error("resource temporarily unavailable")]
    Again = 8,
}

impl Errno {
    /// Returns the negative code placed in the caller's return register.
    pub const fn code(self) -> isize {
        -(self as i32 as isize)
    }

    /// Decodes a syscall return value; non-negative values are not errors.
    pub fn from_code(code: isize) -> Option<Self> {
        let errno = match code {
            -1 => Self::Unspecified,
            -2 => Self::BadEnv,
            -3 => Self::Inval,
            -4 => Self::NoMem,
            -5 => Self::NoFreeEnv,
            -6 => Self::Fault,
            -7 => Self::IpcNotRecv,
            -8 => Self::Again,
            c if c < 0 => Self::Unspecified,
            _ => return None,
        };
        Some(errno)
    }
}
