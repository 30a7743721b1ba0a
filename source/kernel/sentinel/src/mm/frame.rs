// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted physical frame pool.
//!
//! Frames back both user pages and table pages. A frame returns to the free list when
//! its count drops to zero; fresh allocations are zeroed, copies never are.

use log::trace;

use super::page_table::MapError;
use crate::types::PAGE_SIZE;

/// Index of a physical frame in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u32);

impl FrameId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical address of the frame in the model's flat physical space.
    #[inline]
    pub const fn phys_addr(self) -> usize {
        self.index() * PAGE_SIZE
    }
}

struct Frame {
    refs: u32,
    data: Box<[u8; PAGE_SIZE]>,
}

/// Fixed-size pool of frames.
pub struct FramePool {
    frames: Vec<Frame>,
    free: Vec<FrameId>,
    #[cfg(feature = "failpoints")]
    fail_after: Option<usize>,
}

impl FramePool {
    /// Creates a pool of `count` zeroed frames.
    pub fn new(count: usize) -> Self {
        let frames = (0..count).map(|_| Frame { refs: 0, data: Box::new([0; PAGE_SIZE]) }).collect();
        // Lowest index is handed out first.
        let free = (0..count as u32).rev().map(FrameId).collect();
        Self {
            frames,
            free,
            #[cfg(feature = "failpoints")]
            fail_after: None,
        }
    }

    /// Takes a free frame with a reference count of zero.
    ///
    /// The caller owns it until it is mapped (count raised) or handed back via [`Self::release`].
    pub fn alloc(&mut self, zero: bool) -> Result<FrameId, MapError> {
        #[cfg(feature = "failpoints")]
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                return Err(MapError::OutOfMemory);
            }
            *left -= 1;
        }
        let id = self.free.pop().ok_or(MapError::OutOfMemory)?;
        if zero {
            self.frames[id.index()].data.fill(0);
        }
        trace!(target: "mm", "frame alloc {:?}", id);
        Ok(id)
    }

    /// Returns an unreferenced frame to the free list.
    pub fn release(&mut self, id: FrameId) {
        debug_assert_eq!(self.frames[id.index()].refs, 0, "releasing a referenced frame");
        if self.frames[id.index()].refs == 0 {
            self.free.push(id);
        }
    }

    /// Adds one mapping reference.
    pub fn incref(&mut self, id: FrameId) {
        self.frames[id.index()].refs += 1;
    }

    /// Drops one mapping reference, freeing the frame at zero.
    pub fn decref(&mut self, id: FrameId) {
        let frame = &mut self.frames[id.index()];
        debug_assert!(frame.refs > 0, "frame refcount underflow");
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 {
            trace!(target: "mm", "frame free {:?}", id);
            self.free.push(id);
        }
    }

    pub fn refcount(&self, id: FrameId) -> u32 {
        self.frames[id.index()].refs
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn bytes(&self, id: FrameId) -> &[u8; PAGE_SIZE] {
        &self.frames[id.index()].data
    }

    pub fn bytes_mut(&mut self, id: FrameId) -> &mut [u8; PAGE_SIZE] {
        &mut self.frames[id.index()].data
    }

    /// Makes the pool report exhaustion after `allocs` more successful allocations.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&mut self, allocs: Option<usize>) {
        self.fail_after = allocs;
    }
}
