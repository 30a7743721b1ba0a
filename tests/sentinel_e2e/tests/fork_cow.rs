// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use sentinel::{EnvId, Perm, PAGE_SIZE, USTACKTOP, UTEXT, UXSTACKTOP};
use sentinel_e2e::{boot, run_child};
use sentinel_rt::{fork, RtError};

const A: usize = UTEXT;
const SHARED: usize = UTEXT + 4 * PAGE_SIZE;

#[test]
fn child_write_diverges_and_parent_keeps_original() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    parent.page_alloc(EnvId::SELF, A, Perm::PUW).unwrap();
    parent.write(A, b"X").unwrap();

    let child = fork(&parent).unwrap();
    let kid = machine.handle(child);
    // Both sides are copy-on-write before anyone writes.
    assert_eq!(parent.uvpt(A).unwrap().perm, Perm::PU | Perm::COW);
    assert_eq!(kid.uvpt(A).unwrap().perm, Perm::PU | Perm::COW);
    assert_eq!(parent.uvpt(A).unwrap().frame, kid.uvpt(A).unwrap().frame);

    let handle = run_child(&parent, child, |env| {
        let mut before = [0u8; 1];
        env.read(A, &mut before).unwrap();
        env.write(A, b"Y").unwrap();
        let mut after = [0u8; 1];
        env.read(A, &mut after).unwrap();
        (before, after, env.uvpt(A).unwrap())
    });
    let (before, after, child_pte) = handle.join().unwrap();
    assert_eq!(&before, b"X");
    assert_eq!(&after, b"Y");
    assert_eq!(child_pte.perm, Perm::PUW);

    let mut seen = [0u8; 1];
    parent.read(A, &mut seen).unwrap();
    assert_eq!(&seen, b"X");
    assert_ne!(parent.uvpt(A).unwrap().frame, child_pte.frame);
    // The parent still shares nothing writable until it faults too.
    assert_eq!(parent.uvpt(A).unwrap().perm, Perm::PU | Perm::COW);
    parent.write(A, b"Z").unwrap();
    assert_eq!(parent.uvpt(A).unwrap().perm, Perm::PUW);
}

#[test]
fn no_page_stays_writable_after_fork_except_shared_and_exception_stack() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    for i in 0..3 {
        parent.page_alloc(EnvId::SELF, A + i * PAGE_SIZE, Perm::PUW).unwrap();
    }
    parent.page_alloc(EnvId::SELF, SHARED, Perm::PUW | Perm::SHARE).unwrap();
    fork(&parent).unwrap();

    for (va, pte) in parent.mapped_pages() {
        if va == UXSTACKTOP - PAGE_SIZE || va == SHARED {
            continue;
        }
        assert!(!pte.perm.contains(Perm::W), "page {va:#x} still writable");
        assert!(pte.perm.contains(Perm::COW), "page {va:#x} not copy-on-write");
    }
    assert_eq!(parent.uvpt(USTACKTOP - 1).unwrap().perm, Perm::PU | Perm::COW);
}

#[test]
fn shared_pages_stay_shared_both_ways() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    parent.page_alloc(EnvId::SELF, SHARED, Perm::PUW | Perm::SHARE).unwrap();
    parent.write_u32(SHARED, 1).unwrap();

    let child = fork(&parent).unwrap();
    let kid = machine.handle(child);
    assert_eq!(kid.uvpt(SHARED).unwrap().perm, Perm::PUW | Perm::SHARE);
    assert_eq!(parent.uvpt(SHARED).unwrap().perm, Perm::PUW | Perm::SHARE);

    let handle = run_child(&parent, child, |env| {
        let seen = env.read_u32(SHARED).unwrap();
        env.write_u32(SHARED, 2).unwrap();
        seen
    });
    assert_eq!(handle.join().unwrap(), 1);
    assert_eq!(parent.read_u32(SHARED).unwrap(), 2);
    parent.write_u32(SHARED, 3).unwrap();
    assert_eq!(kid.read_u32(SHARED).unwrap(), 3);
}

#[test]
fn exception_stacks_are_private() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    parent.page_alloc(EnvId::SELF, A, Perm::PUW).unwrap();
    let child = fork(&parent).unwrap();
    let kid = machine.handle(child);

    let xstack = UXSTACKTOP - 1;
    let mine = parent.uvpt(xstack).unwrap();
    let theirs = kid.uvpt(xstack).unwrap();
    assert_ne!(mine.frame, theirs.frame);
    assert_eq!(mine.perm, Perm::PUW);
    assert_eq!(theirs.perm, Perm::PUW);

    // A fault in the child lands its record on the child's stack only.
    let handle = run_child(&parent, child, |env| env.write_u32(A, 5));
    handle.join().unwrap().unwrap();
    let parent_fault = machine.with_kernel(|k| k.env(parent.id()).and_then(|e| e.last_fault));
    let child_fault = machine.with_kernel(|k| k.env(child).and_then(|e| e.last_fault));
    assert_eq!(parent_fault, None);
    assert_eq!(child_fault.map(|utf| utf.fault_va), Some(A));
}

#[test]
fn cow_handler_kills_on_foreign_fault() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    parent.page_alloc(EnvId::SELF, A, Perm::PU).unwrap();
    fork(&parent).unwrap();
    // Read-only, not copy-on-write: the handler refuses and the environment dies.
    let err = parent.write_u32(A, 1).unwrap_err();
    assert_eq!(err, RtError::NotCopyOnWrite { va: A });
    assert_eq!(parent.status(), None);
}

#[test]
fn grandchild_inherits_cow_and_counts_balance() {
    let machine = boot(256);
    let root = machine.spawn().unwrap();
    root.page_alloc(EnvId::SELF, A, Perm::PUW).unwrap();
    root.write_u32(A, 10).unwrap();
    let child = fork(&root).unwrap();

    let handle = run_child(&root, child, |env| {
        let grandchild = fork(&env).unwrap();
        let inner = run_child(&env, grandchild, |g| {
            g.write_u32(A, 30).unwrap();
            g.read_u32(A).unwrap()
        });
        env.write_u32(A, 20).unwrap();
        (env.read_u32(A).unwrap(), inner.join().unwrap())
    });
    assert_eq!(handle.join().unwrap(), (20, 30));
    assert_eq!(root.read_u32(A).unwrap(), 10);
}
