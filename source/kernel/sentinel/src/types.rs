// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address layout constants and identifier newtypes shared by every subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: EnvId, UserVa, PAGE_SIZE, UTOP, UXSTACKTOP, USTACKTOP, PFTEMP, UTEXT
//! DEPENDS_ON: static_assertions
//! INVARIANTS: Every layout constant is page-aligned; ids are strictly positive

use core::fmt;

use static_assertions::const_assert;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Entries held by one table page.
pub const PT_ENTRIES: usize = 1024;
/// Bytes of address space covered by one table page.
pub const PT_SPAN: usize = PAGE_SIZE * PT_ENTRIES;

/// Shared-memory ceiling: only addresses below this may be mapped or granted.
pub const UTOP: usize = 0xEEC0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Top of the normal user stack; one guard page sits above it.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Start of user program text.
pub const UTEXT: usize = 0x0080_0000;
/// Scratch region used for temporary mappings.
pub const UTEMP: usize = 0x0040_0000;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: usize = UTEMP + PT_SPAN - PAGE_SIZE;
/// Default initial program break; the heap grows down from here.
pub const UHEAP_TOP: usize = USTACKTOP - PT_SPAN;

const_assert!(UTOP % PT_SPAN == 0);
const_assert!(USTACKTOP % PAGE_SIZE == 0);
const_assert!(PFTEMP % PAGE_SIZE == 0);
const_assert!(PFTEMP < UTEXT);
const_assert!(UHEAP_TOP % PAGE_SIZE == 0);
const_assert!(UHEAP_TOP > UTEXT);

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_floor(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_ceil(addr: usize) -> usize {
    page_floor(addr.saturating_add(PAGE_SIZE - 1))
}

/// A user virtual address validated for the mapping primitives.
///
/// **Invariant**: below `UTOP` and page-aligned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct UserVa(usize);

impl UserVa {
    /// Accepts `addr` only when it is a page-aligned address below the ceiling.
    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        if addr < UTOP && addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Optional grant address: anything at or above the ceiling means "no page".
    ///
    /// Returns `Err(())` for addresses below the ceiling that are not aligned.
    #[inline]
    #[allow(clippy::result_unit_err)]
    pub fn grant(addr: usize) -> Result<Option<Self>, ()> {
        if addr >= UTOP {
            Ok(None)
        } else {
            Self::page_aligned(addr).map(Some).ok_or(())
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Index of the table page covering this address.
    #[inline]
    pub const fn table_index(self) -> usize {
        self.0 / PT_SPAN
    }

    /// Index of the entry inside its table page.
    #[inline]
    pub const fn entry_index(self) -> usize {
        (self.0 / PAGE_SIZE) % PT_ENTRIES
    }

    /// Iterates every page-aligned user address in ascending order.
    pub fn all() -> impl Iterator<Item = UserVa> {
        (0..UTOP).step_by(PAGE_SIZE).map(UserVa)
    }
}

impl fmt::Display for UserVa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Number of low id bits reserved for the slot index.
pub const GEN_SHIFT: u32 = 12;
/// Largest arena supported by the id encoding.
pub const MAX_ENV_SLOTS: usize = 1 << GEN_SHIFT;

/// Environment identifier: slot index in the low bits, generation above.
///
/// **Ownership**: Only `EnvTable` mints ids.
/// **Invariant**: live ids are strictly positive; `0` means "the caller" at the syscall boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Alias for the calling environment at the syscall boundary.
    pub const SELF: Self = Self(0);

    /// An id no slot ever carries: its generation is above the range `EnvTable` mints.
    pub const NEVER: Self = Self(u32::MAX);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Builds an id from its generation and slot components.
    #[inline]
    pub(crate) const fn compose(generation: u32, slot: usize) -> Self {
        Self(generation | slot as u32)
    }

    /// Slot index, masked to the arena size.
    #[inline]
    pub const fn slot(self, max_envs: usize) -> usize {
        self.0 as usize & (max_envs - 1)
    }

    /// Generation component (everything above the slot bits).
    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 & !((MAX_ENV_SLOTS as u32) - 1)
    }

    #[inline]
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<EnvId> for usize {
    #[inline]
    fn from(id: EnvId) -> Self {
        id.0 as usize
    }
}

/// Register values wider than an id decode to `EnvId::NEVER` and resolve to nothing.
impl From<usize> for EnvId {
    #[inline]
    fn from(raw: usize) -> Self {
        u32::try_from(raw).map_or(Self::NEVER, Self)
    }
}
