// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-side runtime built purely on the sentinel syscall surface
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module; threaded scenarios in tests/sentinel_e2e
//!
//! PUBLIC API:
//!   - Machine: shared kernel plus wake-up condition and upcall registry
//!   - Env: per-environment handle with syscall wrappers and MMU-checked memory access
//!   - fork(): copy-on-write fork
//!   - ipc_send()/ipc_recv(): blocking rendezvous helpers
//!   - set_pgfault_handler(): installs the exception stack and upcall
//!
//! DEPENDENCIES:
//!   - sentinel: kernel model
//!   - parking_lot: Mutex/Condvar around the kernel

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod fork;
mod ipc;
mod machine;
mod pgfault;

use thiserror::Error;

use sentinel::Errno;

pub use fork::{duppage, fork, pgfault as cow_fault};
pub use ipc::{ipc_recv, ipc_send, Message};
pub use machine::{Env, Machine};
pub use pgfault::{set_pgfault_handler, PgfaultHandler};

/// Errors surfaced by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RtError {
    /// A syscall returned a negative code.
    #[error("syscall failed: {0}")]
    Errno(#[from] Errno),
    /// The environment was destroyed (fatal fault, explicit destroy, failed buffer check).
    #[error("environment destroyed")]
    Killed,
    /// The copy-on-write handler saw a fault it does not own.
    #[error("fault at {va:#010x} is not a write to a copy-on-write page")]
    NotCopyOnWrite {
        /// Faulting address.
        va: usize,
    },
    /// The handler returned but the access kept faulting.
    #[error("fault at {va:#010x} not resolved by the handler")]
    Unresolved {
        /// Faulting address.
        va: usize,
    },
}

/// Result type used across the runtime.
pub type Result<T> = core::result::Result<T, RtError>;
