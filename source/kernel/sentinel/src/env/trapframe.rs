// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved user register context and the fault record pushed for the upcall.

use crate::mm::FaultCode;

/// Index of the register carrying syscall return values.
pub const REG_RET: usize = 0;
/// Interrupt-enable flag forced on for every user frame.
pub const FL_IF: usize = 0x200;
/// Requested-privilege bits of a user code segment selector.
const CPL_USER: usize = 3;
const WORDS: usize = 12;
/// Size of the serialized frame read by `env_set_trapframe`.
pub const TRAPFRAME_BYTES: usize = WORDS * 8;

/// Saved execution context of an environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: [usize; 8],
    pub pc: usize,
    pub sp: usize,
    pub cs: usize,
    pub eflags: usize,
}

impl TrapFrame {
    /// Value the environment observes as the result of its last syscall.
    pub fn ret(&self) -> usize {
        self.regs[REG_RET]
    }

    pub fn set_ret(&mut self, value: usize) {
        self.regs[REG_RET] = value;
    }

    /// Forces user privilege and enabled interrupts.
    pub fn sanitize(&mut self) {
        self.cs |= CPL_USER;
        self.eflags |= FL_IF;
    }

    /// Little-endian word layout: regs, pc, sp, cs, eflags.
    pub fn to_bytes(&self) -> [u8; TRAPFRAME_BYTES] {
        let mut out = [0u8; TRAPFRAME_BYTES];
        let words = self.regs.iter().chain([&self.pc, &self.sp, &self.cs, &self.eflags]);
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&(*word as u64).to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; TRAPFRAME_BYTES]) -> Self {
        let mut words = [0usize; WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw) as usize;
        }
        let mut regs = [0usize; 8];
        regs.copy_from_slice(&words[..8]);
        Self { regs, pc: words[8], sp: words[9], cs: words[10], eflags: words[11] }
    }
}

/// Fault record handed to the user-level fault upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: usize,
    pub err: FaultCode,
    pub regs: [usize; 8],
    pub pc: usize,
    pub sp: usize,
}

/// Size of a fault record on the exception stack.
pub const UTRAPFRAME_BYTES: usize = WORDS * 8;

impl UTrapframe {
    /// Captures the faulting context of `tf`.
    pub fn new(fault_va: usize, err: FaultCode, tf: &TrapFrame) -> Self {
        Self { fault_va, err, regs: tf.regs, pc: tf.pc, sp: tf.sp }
    }

    /// Little-endian word layout: fault_va, err, regs, pc, sp.
    pub fn to_bytes(&self) -> [u8; UTRAPFRAME_BYTES] {
        let mut out = [0u8; UTRAPFRAME_BYTES];
        let head = [self.fault_va, self.err.bits()];
        let words = head.iter().chain(self.regs.iter()).chain([&self.pc, &self.sp]);
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&(*word as u64).to_le_bytes());
        }
        out
    }
}
