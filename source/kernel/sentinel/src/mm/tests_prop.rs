// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the mapping primitives
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Permission validator accepts exactly P|U-containing subsets of the syscall mask
//!   - Allocate-then-lookup returns the requested permissions with mirrored tables
//!   - Arbitrary alloc/map/unmap sequences keep both tables identical and frames accounted
//!
//! TEST_SCENARIOS:
//!   - validator_matches_rule(): any raw value is accepted iff P|U set and no foreign bits
//!   - alloc_lookup_roundtrip(): valid (va, perm) maps with exactly that perm
//!   - random_ops_keep_tables_mirrored(): mixed op sequences never desynchronize the shadow

use super::*;
use crate::types::{EnvId, UHEAP_TOP};
use proptest::prelude::*;

fn arb_va() -> impl Strategy<Value = UserVa> {
    // A handful of table spans so that table pages are both shared and fresh.
    (0usize..4, 0usize..8).prop_map(|(table, page)| {
        let raw = table * crate::types::PT_SPAN + page * PAGE_SIZE;
        UserVa::page_aligned(raw).unwrap()
    })
}

fn arb_perm() -> impl Strategy<Value = Perm> {
    (any::<bool>(), 0usize..8).prop_map(|(w, avail)| {
        let mut perm = Perm::PU | Perm::from_bits_truncate(avail << 9);
        if w {
            perm |= Perm::W;
        }
        perm
    })
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(UserVa, Perm),
    Map(UserVa, UserVa, Perm),
    Unmap(UserVa),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (arb_va(), arb_perm()).prop_map(|(va, perm)| Op::Alloc(va, perm)),
        (arb_va(), arb_va(), arb_perm()).prop_map(|(s, d, perm)| Op::Map(s, d, perm)),
        arb_va().prop_map(Op::Unmap),
    ]
}

proptest! {
    #[test]
    fn validator_matches_rule(raw in 0usize..0x2000) {
        let accepted = Perm::validate(raw).is_some();
        let rule = raw & 0x5 == 0x5 && raw & !Perm::SYSCALL.bits() == 0;
        prop_assert_eq!(accepted, rule);
    }

    #[test]
    fn alloc_lookup_roundtrip(va in arb_va(), perm in arb_perm()) {
        let mut envs = EnvTable::new(4);
        let mut pool = FramePool::new(16);
        let id = envs.alloc(EnvId::SELF, UHEAP_TOP).unwrap();
        page_alloc(&mut envs, &mut pool, id, id, va, perm).unwrap();
        let pte = lookup(&envs, id, id, va).unwrap().unwrap();
        prop_assert_eq!(pte.perm, perm);
        prop_assert!(envs.get(id).unwrap().space.is_mirrored());
    }

    #[test]
    fn random_ops_keep_tables_mirrored(ops in proptest::collection::vec(arb_op(), 1..40), frames in 3usize..24) {
        let mut envs = EnvTable::new(4);
        let mut pool = FramePool::new(frames);
        let a = envs.alloc(EnvId::SELF, UHEAP_TOP).unwrap();
        let b = envs.alloc(a, UHEAP_TOP).unwrap();
        for op in ops {
            let _ = match op {
                Op::Alloc(va, perm) => page_alloc(&mut envs, &mut pool, a, a, va, perm),
                Op::Map(s, d, perm) => map_between(&mut envs, &mut pool, a, a, s, b, d, perm),
                Op::Unmap(va) => page_unmap(&mut envs, &mut pool, a, a, va),
            };
            prop_assert!(envs.get(a).unwrap().space.is_mirrored());
            prop_assert!(envs.get(b).unwrap().space.is_mirrored());
        }
        envs.free(a, &mut pool).unwrap();
        envs.free(b, &mut pool).unwrap();
        prop_assert_eq!(pool.free_count(), frames);
    }
}
