// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-level page fault handler registration.

use sentinel::{EnvId, Perm, UTrapframe, PAGE_SIZE, UXSTACKTOP};

use crate::machine::Env;
use crate::Result;

/// Handler run on the exception stack for a faulting access.
///
/// Returning an error is fatal for the environment.
pub type PgfaultHandler = fn(&Env, &UTrapframe) -> Result<()>;

/// Installs `handler` for `env`.
///
/// The first installation allocates the exception stack and registers the upcall with the
/// kernel; later calls only swap the handler.
pub fn set_pgfault_handler(env: &Env, handler: PgfaultHandler) -> Result<()> {
    let entry = env.machine().register_upcall(handler);
    let current = env.pgfault_upcall();
    if current.is_none() {
        env.page_alloc(EnvId::SELF, UXSTACKTOP - PAGE_SIZE, Perm::PUW)?;
    }
    if current != Some(entry) {
        env.env_set_pgfault_upcall(EnvId::SELF, entry)?;
    }
    Ok(())
}
