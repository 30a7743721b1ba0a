// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blocking send/receive helpers over the one-shot rendezvous syscalls.

use std::thread;

use log::trace;

use sentinel::{EnvId, Errno, Perm, UTOP};

use crate::machine::Env;
use crate::{Result, RtError};

/// A received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub from: EnvId,
    pub value: u32,
    /// Permissions of the page that arrived at the requested address, empty if none did.
    pub perm: Perm,
}

/// Waits for a message, optionally accepting a page at `dstva`.
pub fn ipc_recv(env: &Env, dstva: Option<usize>) -> Result<Message> {
    env.ipc_recv_raw(dstva.unwrap_or(UTOP))?;
    let ipc = env.ipc_state().ok_or(RtError::Killed)?;
    Ok(Message { from: ipc.from, value: ipc.value, perm: ipc.perm })
}

/// Sends `value` (and optionally the page at `va` with `perm`) to `to`, retrying until the
/// receiver is waiting.
pub fn ipc_send(env: &Env, to: EnvId, value: u32, page: Option<(usize, Perm)>) -> Result<()> {
    let (srcva, perm) = page.unwrap_or((UTOP, Perm::empty()));
    loop {
        match env.ipc_try_send(to, value, srcva, perm) {
            Err(RtError::Errno(Errno::IpcNotRecv)) => {
                trace!(target: "rt", "[{}] {to} not receiving, yielding", env.id());
                env.sys_yield()?;
                thread::yield_now();
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Machine;
    use sentinel::{KernelConfig, PAGE_SIZE, UTEXT};

    #[test]
    fn send_to_missing_env_fails_fast() {
        let config = KernelConfig { max_envs: 8, frames: 64, ..KernelConfig::default() };
        let env = Machine::new(config).unwrap().spawn().unwrap();
        let err = ipc_send(&env, EnvId::from_raw(0x5003), 1, None).unwrap_err();
        assert_eq!(err, RtError::Errno(Errno::BadEnv));
    }

    #[test]
    fn recv_returns_message_and_page() {
        let config = KernelConfig { max_envs: 8, frames: 64, ..KernelConfig::default() };
        let machine = Machine::new(config).unwrap();
        let a = machine.spawn().unwrap();
        let b = machine.spawn().unwrap();
        a.page_alloc(EnvId::SELF, UTEXT, Perm::PUW).unwrap();
        a.write_u32(UTEXT, 0x1234).unwrap();

        let receiver = {
            let b = b.clone();
            thread::spawn(move || {
                let msg = ipc_recv(&b, Some(UTEXT + PAGE_SIZE)).unwrap();
                (msg, b.read_u32(UTEXT + PAGE_SIZE).unwrap())
            })
        };
        ipc_send(&a, b.id(), 9, Some((UTEXT, Perm::PU))).unwrap();
        let (msg, word) = receiver.join().unwrap();
        assert_eq!(msg, Message { from: a.id(), value: 9, perm: Perm::PU });
        assert_eq!(word, 0x1234);
    }
}
