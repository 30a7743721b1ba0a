// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fork built from exofork, page_map and the fault upcall.
//!
//! Writable pages end up mapped `COW` (read-only) in both parent and child; the first
//! write on either side faults into [`pgfault`], which swaps in a private copy through
//! `PFTEMP`. `SHARE` pages stay shared. The exception stack is never copied.

use log::info;

use sentinel::types::page_floor;
use sentinel::{
    EnvId, EnvStatus, Errno, FaultCode, Perm, UTrapframe, PAGE_SIZE, PFTEMP, UXSTACKTOP,
};

use crate::machine::Env;
use crate::pgfault::set_pgfault_handler;
use crate::{Result, RtError};

/// Resolves a write fault on a copy-on-write page with a private writable copy.
pub fn pgfault(env: &Env, utf: &UTrapframe) -> Result<()> {
    let addr = page_floor(utf.fault_va);
    let cow = env.uvpt(addr).is_some_and(|pte| pte.perm.contains(Perm::P | Perm::COW));
    if !utf.err.contains(FaultCode::WRITE) || !cow {
        return Err(RtError::NotCopyOnWrite { va: utf.fault_va });
    }

    env.page_alloc(EnvId::SELF, PFTEMP, Perm::PUW)?;
    let mut page = vec![0u8; PAGE_SIZE];
    env.read(addr, &mut page)?;
    env.write(PFTEMP, &page)?;
    env.page_map(EnvId::SELF, PFTEMP, EnvId::SELF, addr, Perm::PUW)?;
    env.page_unmap(EnvId::SELF, PFTEMP)?;
    Ok(())
}

/// Maps `env`'s page at `va` into `child` following the sharing policy.
pub fn duppage(env: &Env, child: EnvId, va: usize, perm: Perm) -> Result<()> {
    if perm.contains(Perm::SHARE) {
        env.page_map(EnvId::SELF, va, child, va, perm & Perm::SYSCALL)
    } else if perm.intersects(Perm::W | Perm::COW) {
        let cow = Perm::PU | Perm::COW;
        env.page_map(EnvId::SELF, va, child, va, cow)?;
        // Ours must lose W too, or parent writes would leak into the child's view.
        env.page_map(EnvId::SELF, va, EnvId::SELF, va, cow)
    } else {
        env.page_map(EnvId::SELF, va, child, va, perm & Perm::SYSCALL)
    }
}

/// Forks `env`; returns the child id. The child runs once a thread [`Env::adopt`]s it.
pub fn fork(env: &Env) -> Result<EnvId> {
    set_pgfault_handler(env, pgfault)?;
    let child = env.exofork()?;
    if let Err(err) = populate(env, child) {
        let _ = env.env_destroy(child);
        return Err(err);
    }
    info!(target: "rt", "[{}] forked {child}", env.id());
    Ok(child)
}

fn populate(env: &Env, child: EnvId) -> Result<()> {
    let xstack = UXSTACKTOP - PAGE_SIZE;
    for (va, pte) in env.mapped_pages() {
        if va != xstack {
            duppage(env, child, va, pte.perm)?;
        }
    }
    env.page_alloc(child, xstack, Perm::PUW)?;
    let entry = env.pgfault_upcall().ok_or(Errno::Inval)?;
    env.env_set_pgfault_upcall(child, entry)?;
    env.env_set_status(child, EnvStatus::Runnable)
}
