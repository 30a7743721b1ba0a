// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page table with table pages allocated lazily from the frame pool.

use std::collections::BTreeMap;

use super::frame::{FrameId, FramePool};
use super::perm::Perm;
use crate::error::Errno;
use crate::types::{UserVa, PT_ENTRIES, PT_SPAN};

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Address lies at or above the shared-memory ceiling.
    OutOfRange,
    /// Permission set failed validation.
    InvalidFlags,
    /// Request would grant write access to a read-only page.
    PermissionDenied,
    /// Source address has no mapping.
    NotMapped,
    /// No frame left for the page or for a table page.
    OutOfMemory,
}

impl MapError {
    pub const fn errno(self) -> Errno {
        match self {
            Self::OutOfMemory => Errno::NoMem,
            _ => Errno::Inval,
        }
    }
}

/// Leaf entry: frame plus permission bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameId,
    pub perm: Perm,
}

struct TablePage {
    backing: FrameId,
    entries: Box<[Option<Pte>; PT_ENTRIES]>,
    live: usize,
}

/// Outcome of a successful insert, used to undo it exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertReceipt {
    /// The insert had to allocate the covering table page.
    pub created_table: bool,
}

/// One environment-visible (or shadow) mapping table.
#[derive(Default)]
pub struct PageTable {
    tables: BTreeMap<usize, TablePage>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the entry mapped at `va` if it exists.
    pub fn lookup(&self, va: UserVa) -> Option<Pte> {
        self.tables.get(&va.table_index()).and_then(|t| t.entries[va.entry_index()])
    }

    /// Installs `frame` at `va`, replacing (and dereferencing) any previous entry.
    ///
    /// The new reference is taken before the old one is dropped, so re-inserting the
    /// frame already mapped at `va` never frees it.
    pub fn insert(
        &mut self,
        pool: &mut FramePool,
        va: UserVa,
        frame: FrameId,
        perm: Perm,
    ) -> Result<InsertReceipt, MapError> {
        let mut created_table = false;
        if !self.tables.contains_key(&va.table_index()) {
            let backing = pool.alloc(true)?;
            pool.incref(backing);
            self.tables.insert(
                va.table_index(),
                TablePage { backing, entries: Box::new([None; PT_ENTRIES]), live: 0 },
            );
            created_table = true;
        }
        let Some(table) = self.tables.get_mut(&va.table_index()) else {
            return Err(MapError::OutOfMemory);
        };
        pool.incref(frame);
        let slot = &mut table.entries[va.entry_index()];
        match slot.replace(Pte { frame, perm }) {
            Some(old) => pool.decref(old.frame),
            None => table.live += 1,
        }
        Ok(InsertReceipt { created_table })
    }

    /// Removes the entry at `va`, dropping its frame reference. Absent entries are a no-op.
    pub fn remove(&mut self, pool: &mut FramePool, va: UserVa) -> Option<Pte> {
        let table = self.tables.get_mut(&va.table_index())?;
        let old = table.entries[va.entry_index()].take()?;
        table.live -= 1;
        pool.decref(old.frame);
        Some(old)
    }

    /// Undoes an insert described by `receipt`.
    pub fn undo_insert(&mut self, pool: &mut FramePool, va: UserVa, receipt: InsertReceipt) {
        self.remove(pool, va);
        if receipt.created_table {
            self.release_table_if_empty(pool, va.table_index());
        }
    }

    fn release_table_if_empty(&mut self, pool: &mut FramePool, index: usize) {
        if self.tables.get(&index).is_some_and(|t| t.live == 0) {
            if let Some(table) = self.tables.remove(&index) {
                pool.decref(table.backing);
            }
        }
    }

    /// Releases every entry and table page.
    pub fn clear(&mut self, pool: &mut FramePool) {
        for (_, table) in std::mem::take(&mut self.tables) {
            for pte in table.entries.iter().flatten() {
                pool.decref(pte.frame);
            }
            pool.decref(table.backing);
        }
    }

    /// Iterates live mappings in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.tables.iter().flat_map(|(index, table)| {
            table.entries.iter().enumerate().filter_map(move |(slot, pte)| {
                pte.map(|pte| (index * PT_SPAN + slot * crate::types::PAGE_SIZE, pte))
            })
        })
    }

    /// Number of live leaf entries.
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.live).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of table pages currently allocated.
    pub fn table_pages(&self) -> usize {
        self.tables.len()
    }
}
