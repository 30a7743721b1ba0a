// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::thread;

use sentinel::{EnvId, EnvStatus, Errno, Perm, PAGE_SIZE, UTEXT};
use sentinel_e2e::{boot, run_child};
use sentinel_rt::{fork, ipc_recv, ipc_send, Message, RtError};

const ROUNDS: u32 = 10;

#[test]
fn ping_pong_counts_up() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    let child = fork(&parent).unwrap();

    let handle = run_child(&parent, child, |env| {
        let mut last = 0;
        for _ in 0..ROUNDS {
            let msg = ipc_recv(&env, None).unwrap();
            last = msg.value;
            ipc_send(&env, msg.from, msg.value + 1, None).unwrap();
        }
        last
    });

    let mut value = 0;
    for _ in 0..ROUNDS {
        ipc_send(&parent, child, value, None).unwrap();
        let reply = ipc_recv(&parent, None).unwrap();
        assert_eq!(reply.from, child);
        assert_eq!(reply.perm, Perm::empty());
        value = reply.value + 1;
    }
    assert_eq!(value, 2 * ROUNDS);
    assert_eq!(handle.join().unwrap(), 2 * ROUNDS - 2);
}

#[test]
fn granted_page_is_shared_not_copied() {
    let machine = boot(256);
    let parent = machine.spawn().unwrap();
    let child = fork(&parent).unwrap();
    let page = UTEXT + 8 * PAGE_SIZE;
    parent.page_alloc(EnvId::SELF, page, Perm::PUW).unwrap();
    parent.write_u32(page, 1).unwrap();

    let handle = run_child(&parent, child, move |env| {
        let dst = UTEXT + 16 * PAGE_SIZE;
        let first = ipc_recv(&env, Some(dst)).unwrap();
        let seen = env.read_u32(dst).unwrap();
        ipc_send(&env, first.from, seen, None).unwrap();
        ipc_recv(&env, None).unwrap();
        let later = env.read_u32(dst).unwrap();
        (first.perm, later, env.uvpt(dst).unwrap().frame)
    });

    ipc_send(&parent, child, 0, Some((page, Perm::PU))).unwrap();
    assert_eq!(ipc_recv(&parent, None).unwrap().value, 1);
    parent.write_u32(page, 2).unwrap();
    ipc_send(&parent, child, 0, None).unwrap();

    let (perm, later, frame) = handle.join().unwrap();
    assert_eq!(perm, Perm::PU);
    assert_eq!(later, 2);
    assert_eq!(frame, parent.uvpt(page).unwrap().frame);
}

#[test]
fn receiver_without_destination_gets_value_only() {
    let machine = boot(128);
    let a = machine.spawn().unwrap();
    let b = machine.spawn().unwrap();
    a.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();

    let receiver = {
        let b = b.clone();
        thread::spawn(move || ipc_recv(&b, None).unwrap())
    };
    ipc_send(&a, b.id(), 42, Some((UTEXT, Perm::PU))).unwrap();
    let msg = receiver.join().unwrap();
    assert_eq!(msg, Message { from: a.id(), value: 42, perm: Perm::empty() });
    // Unrelated environments may talk; only the page transfer was dropped.
    assert_eq!(b.mapped_pages().len(), 1);
}

#[test]
fn granting_write_on_read_only_page_fails_for_sender() {
    let machine = boot(128);
    let a = machine.spawn().unwrap();
    let b = machine.spawn().unwrap();
    a.page_alloc(EnvId::SELF, UTEXT, Perm::PU).unwrap();

    let receiver = {
        let b = b.clone();
        thread::spawn(move || ipc_recv(&b, Some(UTEXT)).unwrap())
    };
    // ipc_send retries until the receiver waits, so the failure is the permission one.
    let err = ipc_send(&a, b.id(), 1, Some((UTEXT, Perm::PUW))).unwrap_err();
    assert_eq!(err, RtError::Errno(Errno::Inval));
    assert_eq!(b.status(), Some(EnvStatus::NotRunnable));

    ipc_send(&a, b.id(), 2, Some((UTEXT, Perm::PU))).unwrap();
    let msg = receiver.join().unwrap();
    assert_eq!(msg.value, 2);
    assert_eq!(msg.perm, Perm::PU);
}

#[test]
fn receiver_destroyed_while_waiting_wakes_as_killed() {
    let machine = boot(128);
    let parent = machine.spawn().unwrap();
    let child = fork(&parent).unwrap();
    let kid = machine.handle(child);

    let handle = run_child(&parent, child, |env| ipc_recv(&env, None));
    while kid.status() != Some(EnvStatus::NotRunnable) {
        thread::yield_now();
    }
    parent.env_destroy(child).unwrap();
    assert_eq!(handle.join().unwrap(), Err(RtError::Killed));
}
