// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping primitives over mirrored address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: page_alloc, map_between, page_unmap, lookup, user_mem_check, copy_{from,to}_user,
//!             mmu_{read,write}, AddressSpace, FramePool, Perm, MapError, VmError
//! DEPENDS_ON: env::EnvTable, types::UserVa
//! INVARIANTS: Validation precedes mutation; both tables change together or not at all;
//!             frame counts move only inside AddressSpace/PageTable

mod address_space;
mod frame;
mod page_table;
mod perm;

#[cfg(test)]
mod tests_prop;

use log::debug;

pub use address_space::AddressSpace;
pub use frame::{FrameId, FramePool};
pub use page_table::{InsertReceipt, MapError, PageTable, Pte};
pub use perm::{FaultCode, Perm};

use crate::env::{Env, EnvError, EnvTable};
use crate::error::Errno;
use crate::types::{page_floor, EnvId, UserVa, PAGE_SIZE, UTOP};

/// Failure of a mapping primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Env(EnvError),
    Map(MapError),
}

impl VmError {
    pub const fn errno(self) -> Errno {
        match self {
            Self::Env(err) => err.errno(),
            Self::Map(err) => err.errno(),
        }
    }
}

impl From<EnvError> for VmError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for VmError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

/// Validates a raw address for the mapping primitives.
pub fn check_va(raw: usize) -> Result<UserVa, MapError> {
    if raw >= UTOP {
        return Err(MapError::OutOfRange);
    }
    UserVa::page_aligned(raw).ok_or(MapError::Unaligned)
}

/// Validates a raw permission set for the mapping primitives.
pub fn check_perm(raw: usize) -> Result<Perm, MapError> {
    Perm::validate(raw).ok_or(MapError::InvalidFlags)
}

/// Allocates a zeroed frame and maps it at `va` in `target`, replacing any previous page.
pub fn page_alloc(
    envs: &mut EnvTable,
    pool: &mut FramePool,
    caller: EnvId,
    target: EnvId,
    va: UserVa,
    perm: Perm,
) -> Result<(), VmError> {
    let id = envs.resolve(caller, target, true)?;
    let env = envs.live_mut(id)?;
    let frame = pool.alloc(true)?;
    env.space.insert(pool, va, frame, perm)?;
    debug!(target: "mm", "[{caller}] page_alloc {id} {va} {perm:?} -> {frame:?}");
    Ok(())
}

/// Copies the mapping at `src`/`srcva` to `dst`/`dstva` with `perm`.
///
/// Only the destination needs the caller's authority.
#[allow(clippy::too_many_arguments)]
pub fn map_between(
    envs: &mut EnvTable,
    pool: &mut FramePool,
    caller: EnvId,
    src: EnvId,
    srcva: UserVa,
    dst: EnvId,
    dstva: UserVa,
    perm: Perm,
) -> Result<(), VmError> {
    let src_id = envs.resolve(caller, src, false)?;
    let dst_id = envs.resolve(caller, dst, true)?;
    let pte = envs.get(src_id).and_then(|e| e.space.lookup(srcva)).ok_or(MapError::NotMapped)?;
    grant_into(envs.live_mut(dst_id)?, pool, pte, dstva, perm)?;
    debug!(target: "mm", "[{caller}] page_map {src_id}:{srcva} -> {dst_id}:{dstva} {perm:?}");
    Ok(())
}

/// Installs an existing mapping `pte` into `dst` at `dstva`, refusing write upgrades.
pub(crate) fn grant_into(
    dst: &mut Env,
    pool: &mut FramePool,
    pte: Pte,
    dstva: UserVa,
    perm: Perm,
) -> Result<(), MapError> {
    if perm.contains(Perm::W) && !pte.perm.contains(Perm::W) {
        return Err(MapError::PermissionDenied);
    }
    dst.space.insert(pool, dstva, pte.frame, perm)
}

/// Removes the mapping at `va` in `target`; succeeds when nothing is mapped.
pub fn page_unmap(
    envs: &mut EnvTable,
    pool: &mut FramePool,
    caller: EnvId,
    target: EnvId,
    va: UserVa,
) -> Result<(), VmError> {
    let id = envs.resolve(caller, target, true)?;
    let removed = envs.live_mut(id)?.space.remove(pool, va);
    debug!(target: "mm", "[{caller}] page_unmap {id} {va} (was {removed:?})");
    Ok(())
}

/// Frame and permissions mapped at `va` in `target`, if any.
pub fn lookup(
    envs: &EnvTable,
    caller: EnvId,
    target: EnvId,
    va: UserVa,
) -> Result<Option<Pte>, VmError> {
    let id = envs.resolve(caller, target, false)?;
    Ok(envs.get(id).and_then(|e| e.space.lookup(va)))
}

/// Checks that every page of `[va, va + len)` is mapped in the shadow with `perm | P | U`.
///
/// Returns the first offending address on failure.
pub fn user_mem_check(env: &Env, va: usize, len: usize, perm: Perm) -> Result<(), usize> {
    if len == 0 {
        return Ok(());
    }
    let end = va.checked_add(len).ok_or(va)?;
    let need = perm | Perm::PU;
    let mut page = page_floor(va);
    while page < end {
        let fault_at = page.max(va);
        let va_ok = UserVa::page_aligned(page).ok_or(fault_at)?;
        match env.space.shadow_lookup(va_ok) {
            Some(pte) if pte.perm.contains(need) => {}
            _ => return Err(fault_at),
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

fn for_each_chunk(
    va: usize,
    len: usize,
    mut f: impl FnMut(UserVa, usize, core::ops::Range<usize>) -> Result<(), usize>,
) -> Result<(), usize> {
    let mut done = 0;
    while done < len {
        let addr = va + done;
        let page = UserVa::page_aligned(page_floor(addr)).ok_or(addr)?;
        let offset = addr - page.raw();
        let n = (PAGE_SIZE - offset).min(len - done);
        f(page, offset, done..done + n)?;
        done += n;
    }
    Ok(())
}

/// Kernel read of user memory through the shadow table. Callers check the range first.
pub fn copy_from_user(env: &Env, pool: &FramePool, va: usize, buf: &mut [u8]) -> Result<(), usize> {
    for_each_chunk(va, buf.len(), |page, offset, range| {
        let pte = env.space.shadow_lookup(page).ok_or(page.raw() + offset)?;
        let n = range.len();
        buf[range].copy_from_slice(&pool.bytes(pte.frame)[offset..offset + n]);
        Ok(())
    })
}

/// Kernel write of user memory through the shadow table. Callers check the range first.
pub fn copy_to_user(env: &Env, pool: &mut FramePool, va: usize, data: &[u8]) -> Result<(), usize> {
    for_each_chunk(va, data.len(), |page, offset, range| {
        let pte = env.space.shadow_lookup(page).ok_or(page.raw() + offset)?;
        let n = range.len();
        pool.bytes_mut(pte.frame)[offset..offset + n].copy_from_slice(&data[range]);
        Ok(())
    })
}

/// Fault raised by a user access that the user table does not permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub va: usize,
    pub code: FaultCode,
}

fn mmu_translate(space: &AddressSpace, addr: usize, write: bool) -> Result<Pte, PageFault> {
    let mut code = FaultCode::USER;
    if write {
        code |= FaultCode::WRITE;
    }
    let page = UserVa::page_aligned(page_floor(addr)).ok_or(PageFault { va: addr, code })?;
    let pte = space.lookup(page).ok_or(PageFault { va: addr, code })?;
    let need = if write { Perm::PUW } else { Perm::PU };
    if !pte.perm.contains(need) {
        return Err(PageFault { va: addr, code: code | FaultCode::PRESENT });
    }
    Ok(pte)
}

/// User-mode load: the access an environment performs itself, checked against its own table.
pub fn mmu_read(
    space: &AddressSpace,
    pool: &FramePool,
    va: usize,
    buf: &mut [u8],
) -> Result<(), PageFault> {
    let mut done = 0;
    while done < buf.len() {
        let addr = va.checked_add(done).ok_or(PageFault { va, code: FaultCode::USER })?;
        let pte = mmu_translate(space, addr, false)?;
        let offset = addr % PAGE_SIZE;
        let n = (PAGE_SIZE - offset).min(buf.len() - done);
        buf[done..done + n].copy_from_slice(&pool.bytes(pte.frame)[offset..offset + n]);
        done += n;
    }
    Ok(())
}

/// User-mode store. Every page is checked before any byte is written.
pub fn mmu_write(
    space: &AddressSpace,
    pool: &mut FramePool,
    va: usize,
    data: &[u8],
) -> Result<(), PageFault> {
    let end = va.checked_add(data.len()).ok_or(PageFault { va, code: FaultCode::USER })?;
    let mut page = page_floor(va);
    while page < end {
        mmu_translate(space, page.max(va), true)?;
        page += PAGE_SIZE;
    }
    let mut done = 0;
    while done < data.len() {
        let addr = va + done;
        let pte = mmu_translate(space, addr, true)?;
        let offset = addr % PAGE_SIZE;
        let n = (PAGE_SIZE - offset).min(data.len() - done);
        pool.bytes_mut(pte.frame)[offset..offset + n].copy_from_slice(&data[done..done + n]);
        done += n;
    }
    Ok(())
}
