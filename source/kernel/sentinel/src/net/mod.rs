// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Raw packet send/receive leaves reached through the syscall table
//! OWNERS: @kernel-net-team
//! PUBLIC API: NetDevice, NetError, LoopbackNic, MAX_PACKET, MAC_LEN
//! DEPENDS_ON: error::Errno
//! INVARIANTS: Devices only ever see kernel-side buffers; user ranges are checked by the caller

use std::collections::VecDeque;

use log::trace;

use crate::error::Errno;

/// Largest Ethernet frame accepted for transmit.
pub const MAX_PACKET: usize = 1518;
/// Bytes in a MAC address.
pub const MAC_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Ring full on transmit, or nothing to receive.
    Again,
    /// Oversized frame, or a receive buffer too small for the pending frame.
    Invalid,
}

impl NetError {
    pub const fn errno(self) -> Errno {
        match self {
            Self::Again => Errno::Again,
            Self::Invalid => Errno::Inval,
        }
    }
}

/// Driver boundary for the NIC; ring management lives behind it.
pub trait NetDevice: Send {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), NetError>;
    /// Copies one pending frame into `buf` and returns its length.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, NetError>;
    fn mac_address(&self) -> [u8; MAC_LEN];
}

/// Device whose transmitted frames come back as received frames.
pub struct LoopbackNic {
    ring: VecDeque<Vec<u8>>,
    ring_size: usize,
    mac: [u8; MAC_LEN],
}

impl LoopbackNic {
    /// QEMU's default MAC, handy for logs.
    pub const DEFAULT_MAC: [u8; MAC_LEN] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    pub fn new(ring_size: usize) -> Self {
        Self { ring: VecDeque::with_capacity(ring_size), ring_size, mac: Self::DEFAULT_MAC }
    }

    pub fn pending(&self) -> usize {
        self.ring.len()
    }
}

impl NetDevice for LoopbackNic {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), NetError> {
        if frame.len() > MAX_PACKET {
            return Err(NetError::Invalid);
        }
        if self.ring.len() >= self.ring_size {
            return Err(NetError::Again);
        }
        self.ring.push_back(frame.to_vec());
        trace!(target: "net", "loopback tx {} bytes", frame.len());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        let Some(frame) = self.ring.front() else {
            return Err(NetError::Again);
        };
        if frame.len() > buf.len() {
            return Err(NetError::Invalid);
        }
        let n = frame.len();
        buf[..n].copy_from_slice(frame);
        self.ring.pop_front();
        Ok(n)
    }

    fn mac_address(&self) -> [u8; MAC_LEN] {
        self.mac
    }
}
