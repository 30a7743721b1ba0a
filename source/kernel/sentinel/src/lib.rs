// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Privilege-separation core of an exokernel-style kernel, modelled on the host
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests per module; scenarios in tests/sentinel_e2e
//! PUBLIC API: Kernel, KernelConfig, SyscallOutcome, Errno, EnvId, Perm, syscall numbers
//! DEPENDS_ON: bitflags, static_assertions, log, thiserror, serde, toml
//! INVARIANTS: User and shadow tables stay identical below UTOP; validation precedes
//!             mutation in every primitive; stale environment ids never resolve

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod env;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod net;
pub mod sched;
pub mod syscall;
pub mod types;

pub use config::{ConfigError, KernelConfig};
pub use env::{EnvStatus, TrapFrame, UTrapframe};
pub use error::Errno;
pub use kernel::{AccessError, FaultDisposition, Kernel, SyscallOutcome};
pub use mm::{FaultCode, PageFault, Perm, Pte};
pub use syscall::Args;
pub use types::{EnvId, PAGE_SIZE, PFTEMP, USTACKTOP, UTEMP, UTEXT, UTOP, UXSTACKTOP};
