// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(feature = "queued-send")]

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use sentinel::{EnvId, EnvStatus, Perm, PAGE_SIZE, UTEXT};
use sentinel_e2e::boot;
use sentinel_rt::{ipc_recv, ipc_send, Env, Machine, RtError};

fn wait_queued(machine: &Arc<Machine>, n: usize) {
    while machine.with_kernel(|k| k.queued_sends()) != n {
        thread::yield_now();
    }
}

fn send_in_background(env: &Env, to: EnvId, value: u32) -> JoinHandle<Result<(), RtError>> {
    let env = env.clone();
    thread::spawn(move || ipc_send(&env, to, value, None))
}

#[test]
fn sender_parks_until_receiver_asks() {
    let machine = boot(128);
    let a = machine.spawn().unwrap();
    let b = machine.spawn().unwrap();

    let sender = send_in_background(&a, b.id(), 11);
    wait_queued(&machine, 1);
    assert_eq!(a.status(), Some(EnvStatus::NotRunnable));

    let msg = ipc_recv(&b, None).unwrap();
    assert_eq!((msg.from, msg.value), (a.id(), 11));
    assert_eq!(sender.join().unwrap(), Ok(()));
    assert_eq!(a.status(), Some(EnvStatus::Runnable));
    assert_eq!(machine.with_kernel(|k| k.queued_sends()), 0);
}

#[test]
fn parked_senders_are_served_in_order() {
    let machine = boot(128);
    let a = machine.spawn().unwrap();
    let c = machine.spawn().unwrap();
    let b = machine.spawn().unwrap();

    let first = send_in_background(&a, b.id(), 1);
    wait_queued(&machine, 1);
    let second = send_in_background(&c, b.id(), 2);
    wait_queued(&machine, 2);

    assert_eq!(ipc_recv(&b, None).unwrap().from, a.id());
    assert_eq!(ipc_recv(&b, None).unwrap().from, c.id());
    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
}

#[test]
fn parked_page_grant_lands_on_receive() {
    let machine = boot(128);
    let a = machine.spawn().unwrap();
    let b = machine.spawn().unwrap();
    a.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();
    a.write_u32(UTEXT, 0xfeed).unwrap();

    let sender = {
        let a = a.clone();
        let to = b.id();
        thread::spawn(move || ipc_send(&a, to, 5, Some((UTEXT, Perm::PU))))
    };
    wait_queued(&machine, 1);

    let dst = UTEXT + 4 * PAGE_SIZE;
    let msg = ipc_recv(&b, Some(dst)).unwrap();
    assert_eq!(msg.perm, Perm::PU);
    assert_eq!(b.read_u32(dst).unwrap(), 0xfeed);
    sender.join().unwrap().unwrap();
}

#[test]
fn destroying_a_parked_sender_drops_its_message() {
    let machine = boot(128);
    let a = machine.spawn().unwrap();
    let b = machine.spawn().unwrap();

    let sender = send_in_background(&a, b.id(), 3);
    wait_queued(&machine, 1);
    machine.with_kernel(|k| k.destroy_env(a.id())).unwrap();
    assert_eq!(sender.join().unwrap(), Err(RtError::Killed));
    assert_eq!(machine.with_kernel(|k| k.queued_sends()), 0);

    // Nothing left to deliver: the receiver now waits for a live sender.
    let c = machine.spawn().unwrap();
    let receiver = {
        let b = b.clone();
        thread::spawn(move || ipc_recv(&b, None).unwrap())
    };
    ipc_send(&c, b.id(), 4, None).unwrap();
    let msg = receiver.join().unwrap();
    assert_eq!((msg.from, msg.value), (c.id(), 4));
}
