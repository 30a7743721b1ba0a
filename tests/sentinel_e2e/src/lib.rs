// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use sentinel::{EnvId, KernelConfig};
use sentinel_rt::{Env, Machine};

/// Boots a machine sized for scenario tests.
pub fn boot(frames: usize) -> Arc<Machine> {
    let config = KernelConfig { max_envs: 16, frames, ..KernelConfig::default() };
    Machine::new(config).expect("boot machine")
}

/// Runs `body` as the forked `child` of `parent` on its own thread.
pub fn run_child<T, F>(parent: &Env, child: EnvId, body: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce(Env) -> T + Send + 'static,
{
    let parent = parent.clone();
    thread::spawn(move || {
        let env = parent.adopt(child).expect("child becomes runnable");
        body(env)
    })
}

/// Free frames right now.
pub fn free_frames(machine: &Machine) -> usize {
    machine.with_kernel(|k| k.frames().free_count())
}
