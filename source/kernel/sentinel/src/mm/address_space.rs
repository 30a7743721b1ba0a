// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mirrored address space: the user-facing table and its kernel shadow behind one interface.
//!
//! Call sites never reach either table for mutation directly. Every insert or remove is
//! replayed on the shadow in the same call, and a shadow failure restores the user table
//! to exactly what it held before the call.

use log::debug;

use super::frame::{FrameId, FramePool};
use super::page_table::{MapError, PageTable, Pte};
use super::perm::Perm;
use crate::types::UserVa;

/// User table plus kernel shadow, kept identical by construction.
#[derive(Default)]
pub struct AddressSpace {
    user: PageTable,
    shadow: PageTable,
    #[cfg(feature = "failpoints")]
    fail_shadow: bool,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping visible to the environment at `va`.
    pub fn lookup(&self, va: UserVa) -> Option<Pte> {
        let pte = self.user.lookup(va);
        debug_assert_eq!(pte, self.shadow.lookup(va), "shadow diverged at {va}");
        pte
    }

    /// Mapping as recorded by the kernel shadow; used for every kernel access to user memory.
    pub fn shadow_lookup(&self, va: UserVa) -> Option<Pte> {
        self.shadow.lookup(va)
    }

    /// Installs `frame` at `va` in both tables.
    ///
    /// On error neither table changed and `frame`'s count is as before; a frame that
    /// entered with no references is back in the pool.
    pub fn insert(
        &mut self,
        pool: &mut FramePool,
        va: UserVa,
        frame: FrameId,
        perm: Perm,
    ) -> Result<(), MapError> {
        // Pin the incoming frame and whatever we may displace until the outcome is known.
        pool.incref(frame);
        let previous = self.user.lookup(va);
        if let Some(prev) = previous {
            pool.incref(prev.frame);
        }

        let result = self.insert_pinned(pool, va, frame, perm, previous);

        if let Some(prev) = previous {
            pool.decref(prev.frame);
        }
        pool.decref(frame);
        result
    }

    fn insert_pinned(
        &mut self,
        pool: &mut FramePool,
        va: UserVa,
        frame: FrameId,
        perm: Perm,
        previous: Option<Pte>,
    ) -> Result<(), MapError> {
        let receipt = self.user.insert(pool, va, frame, perm)?;
        if let Err(err) = self.shadow_insert(pool, va, frame, perm) {
            match previous {
                // Table page already existed, so restoring cannot allocate.
                Some(prev) => {
                    let _ = self.user.insert(pool, va, prev.frame, prev.perm);
                }
                None => self.user.undo_insert(pool, va, receipt),
            }
            debug!(target: "mm", "shadow insert at {va} failed, user side rolled back");
            return Err(err);
        }
        Ok(())
    }

    fn shadow_insert(
        &mut self,
        pool: &mut FramePool,
        va: UserVa,
        frame: FrameId,
        perm: Perm,
    ) -> Result<(), MapError> {
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.fail_shadow) {
            return Err(MapError::OutOfMemory);
        }
        self.shadow.insert(pool, va, frame, perm).map(|_| ())
    }

    /// Removes any mapping at `va` from both tables; a no-op when nothing is mapped.
    pub fn remove(&mut self, pool: &mut FramePool, va: UserVa) -> Option<Pte> {
        let user = self.user.remove(pool, va);
        let shadow = self.shadow.remove(pool, va);
        debug_assert_eq!(user, shadow, "shadow diverged at {va}");
        user
    }

    /// Releases every mapping and table page of both tables.
    pub fn clear(&mut self, pool: &mut FramePool) {
        self.user.clear(pool);
        self.shadow.clear(pool);
    }

    /// Live mappings in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.user.mappings()
    }

    /// Returns true when both tables hold identical mappings.
    pub fn is_mirrored(&self) -> bool {
        self.user.len() == self.shadow.len()
            && self.user.mappings().eq(self.shadow.mappings())
    }

    pub fn len(&self) -> usize {
        self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }

    /// Table pages held across both tables.
    pub fn table_pages(&self) -> usize {
        self.user.table_pages() + self.shadow.table_pages()
    }

    /// Makes the next shadow-side insert fail with out-of-memory.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_shadow_insert(&mut self) {
        self.fail_shadow = true;
    }
}
