// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Cross-process block/wake channel.
//!
//! A condition variable cannot live in shared memory, because the OS
//! handles that carry a wakeup are per-process. This module substitutes a
//! rendezvous through abstract-namespace datagram sockets: the socket
//! *names* can live in shared memory, and socket ownership dies with the
//! owning process, which is exactly the liveness property a crashed peer
//! needs.
//!
//! # Protocol
//!
//! ```text
//! shared BwRecord (in the mapped ring header)
//! +--------+----------------------------------------------+
//! | seqno  | slots[64]: { pid, "@xxxxx" socket name }     |
//! +--------+----------------------------------------------+
//!
//! waiter: binds an autobound abstract datagram socket, publishes
//!         {pid, name} in a free slot, bumps seqno, blocks on the socket
//! waker:  connects a datagram socket to every occupied slot; on wake,
//!         re-syncs against seqno then sends one byte to each peer
//! ```
//!
//! Slot insertion/removal bumps `seqno`; wakers cache the last seen value
//! and reconcile their socket set only when it moves. A peer that died
//! without cleaning up is detected either by the liveness check during
//! prune, or when a wake send fails, and its slot is reclaimed in place.
//!
//! All functions that touch the shared record are called with the ring
//! range lock held; the blocking wait itself runs unlocked.

mod channel;
mod liveness;

pub use channel::{BwWaiter, BwWaker};
pub use liveness::{has_pid_socket, Liveness};

use std::fmt;
use std::io;

/// Bytes reserved for a socket name in a slot, including the leading `@`
/// and a terminating NUL. Linux autobound abstract names ("\0xxxxx",
/// five hex digits) fit with room to spare.
pub const BW_NAMELEN: usize = 8;

/// Waiter slots per record; also the maximum number of processes that can
/// block on one direction of one ring at once.
pub const BW_WAITMAX: usize = 64;

/// One waiter registration in a shared record.
///
/// `pid == 0` means vacant. A non-zero pid is a locator, not a resource:
/// the registering process may be long gone, and every dereference first
/// verifies liveness.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BwSlot {
    /// Registering process, 0 when the slot is vacant
    pub pid: libc::pid_t,
    /// Friendly socket name, `@xxxxx` NUL-padded
    pub name: [u8; BW_NAMELEN],
}

/// Shared coordination record for one wake direction.
///
/// Embedded in the ring control header; must stay free of pointers since
/// it is mapped into the address space of unrelated processes.
#[repr(C)]
#[derive(Debug)]
pub struct BwRecord {
    /// Bumped on every slot insertion or removal
    pub seqno: i32,
    /// Waiter registrations
    pub slots: [BwSlot; BW_WAITMAX],
}

/// Errors surfaced by the block/wake channel.
#[derive(Debug)]
pub enum BwError {
    /// Socket creation failed
    Socket(io::Error),

    /// Autobind of the listener failed
    Bind(io::Error),

    /// Connect to a peer socket failed (peer confirmed alive)
    Connect(io::Error),

    /// Poll set operation failed
    Poll(io::Error),

    /// Receive on the listener failed
    Recv(io::Error),

    /// Self-wake send failed
    Send(io::Error),

    /// FIONREAD on the listener failed
    Ioctl(io::Error),

    /// All waiter slots in the shared record are occupied
    SlotsExhausted,

    /// A descriptor registered via `watch_fd` became readable while
    /// blocked in `wait`
    WatchedFdReady,
}

impl fmt::Display for BwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "socket: {e}"),
            Self::Bind(e) => write!(f, "bind: {e}"),
            Self::Connect(e) => write!(f, "connect: {e}"),
            Self::Poll(e) => write!(f, "poll: {e}"),
            Self::Recv(e) => write!(f, "recv: {e}"),
            Self::Send(e) => write!(f, "send: {e}"),
            Self::Ioctl(e) => write!(f, "ioctl: {e}"),
            Self::SlotsExhausted => write!(f, "waiter slots exhausted"),
            Self::WatchedFdReady => write!(f, "watched descriptor ready"),
        }
    }
}

impl std::error::Error for BwError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socket(e)
            | Self::Bind(e)
            | Self::Connect(e)
            | Self::Poll(e)
            | Self::Recv(e)
            | Self::Send(e)
            | Self::Ioctl(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for block/wake operations
pub type Result<T> = std::result::Result<T, BwError>;

impl BwSlot {
    /// The friendly name as a str, up to the NUL terminator.
    #[must_use]
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BW_NAMELEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn record_layout() {
        assert_eq!(mem::size_of::<BwSlot>(), 4 + BW_NAMELEN);
        assert_eq!(
            mem::size_of::<BwRecord>(),
            4 + BW_WAITMAX * mem::size_of::<BwSlot>()
        );
    }

    #[test]
    fn slot_name_str() {
        let mut s = BwSlot {
            pid: 1,
            name: [0; BW_NAMELEN],
        };
        s.name[..6].copy_from_slice(b"@4ae21");
        assert_eq!(s.name_str(), "@4ae21");
    }
}
