// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Permission bits carried by user mappings and the syscall-boundary validator.

use bitflags::bitflags;

bitflags! {
    /// Flags stored with every user page mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Perm: usize {
        const P = 0x001;
        const W = 0x002;
        const U = 0x004;
        /// Software-available bits; COW and SHARE live here.
        const AVAIL = 0xE00;
        /// Shared page, exempt from copy-on-write on fork.
        const SHARE = 0x400;
        /// Write-protected pending private duplication.
        const COW = 0x800;
    }
}

bitflags! {
    /// Error code attached to a page fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FaultCode: usize {
        /// Protection violation on a present page (clear: page not present).
        const PRESENT = 0x1;
        const WRITE = 0x2;
        const USER = 0x4;
    }
}

impl Perm {
    /// Every bit a caller may pass through the syscall boundary.
    pub const SYSCALL: Self = Self::P.union(Self::W).union(Self::U).union(Self::AVAIL);
    /// Minimum bits for any user-reachable mapping.
    pub const PU: Self = Self::P.union(Self::U);
    /// Plain private writable page.
    pub const PUW: Self = Self::PU.union(Self::W);

    /// Decodes a raw register; unknown bits are rejected rather than truncated.
    pub fn from_raw(raw: usize) -> Option<Self> {
        Self::from_bits(raw)
    }

    /// Validates a caller-supplied permission set: `P|U` required, nothing outside `SYSCALL`.
    pub fn validate(raw: usize) -> Option<Self> {
        let perm = Self::from_raw(raw)?;
        if !perm.contains(Self::PU) || !Self::SYSCALL.contains(perm) {
            return None;
        }
        Some(perm)
    }
}
