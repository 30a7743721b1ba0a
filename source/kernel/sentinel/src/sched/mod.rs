// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Round-robin choice of the next runnable environment.
//!
//! Only the "run something else now" entry point is modelled: the kernel records which
//! environment it would hand the CPU to. Preemption is driven from outside.

use crate::env::{EnvStatus, EnvTable};
use crate::types::EnvId;

#[derive(Default)]
pub struct Scheduler {
    current: Option<EnvId>,
    switches: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<EnvId> {
        self.current
    }

    /// Number of times the CPU changed hands.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Notes that `id` entered the kernel, i.e. it is the one running.
    pub fn enter(&mut self, id: EnvId) {
        if self.current != Some(id) {
            self.current = Some(id);
            self.switches += 1;
        }
    }

    /// Picks the next runnable environment after the current one, the current one last.
    pub fn pick_next(&mut self, envs: &EnvTable) -> Option<EnvId> {
        let next = envs
            .ids_after(self.current)
            .find(|id| envs.get(*id).is_some_and(|e| e.status == EnvStatus::Runnable));
        if let Some(id) = next {
            self.enter(id);
        } else {
            self.current = None;
        }
        next
    }
}
