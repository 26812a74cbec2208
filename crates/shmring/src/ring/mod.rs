// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Multi-process message ring over a memory-mapped file.
//!
//! The ring is a single backing file, typically on tmpfs, that unrelated
//! processes map into their address spaces. Producers enqueue byte-framed
//! messages and consumers dequeue them; every mutation of the shared state
//! happens under an advisory whole-file range lock, so no daemon or broker
//! is involved.
//!
//! # File Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | RingCtrl (magic, flags, cursors, stats, two BwRecords)       |
//! +--------------------------------------------------------------+
//! | data area (n bytes; message bodies, may wrap)                |
//! +--------------------------------------------------------------+
//! | padding (aligns index to word size)                          |
//! +--------------------------------------------------------------+
//! | message index (mm entries of {pos, len})                     |
//! +--------------------------------------------------------------+
//! | app data (opaque caller bytes, optional)                     |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Blocking
//!
//! Readers waiting for data and writers waiting for space suspend on the
//! block/wake channel in [`crate::bw`]; the two `BwRecord`s embedded in the
//! control header carry the rendezvous state.

mod cache;
mod file;
mod handle;
mod layout;

pub use handle::{CreateOptions, MsgSpan, OpenOptions, ReadBatch, Ring, RingStats};
pub use layout::{default_max_msgs, MsgSlot, RingCtrl, StatBlock, MAGIC};

use crate::bw::BwError;
use std::fmt;
use std::io;

/// Global flag bits stored in the control header at creation.
/// These never change for the lifetime of the ring file.
pub(crate) mod gflags {
    /// Unread eldest messages are dropped to make room for new writes.
    pub const DROP: u32 = 1 << 1;
    /// An opaque app-data region follows the message index.
    pub const APPDATA: u32 = 1 << 2;
    /// Broadcast semantics: reads do not consume; implies `DROP`.
    pub const FARM: u32 = 1 << 3;
    /// `msync` the mapping at the end of every locked region.
    pub const SYNC: u32 = 1 << 5;
    /// `mlock` the mapping at open time.
    pub const MLOCK: u32 = 1 << 6;

    /// Mask of all defined bits; anything else is reserved.
    pub const ALL: u32 = DROP | APPDATA | FARM | SYNC | MLOCK;
}

/// Errors surfaced by ring operations.
///
/// Calls that transfer bytes return `Result<usize>`; `Ok(0)` means
/// "ring empty" (reads) or "ring full" (writes) on a non-blocking handle.
/// Zero-length messages are rejected outright, so `Ok(0)` is unambiguous.
#[derive(Debug)]
pub enum RingError {
    /// Caller-supplied flags, sizes or buffers are unusable.
    /// Reported before any shared state is touched.
    InvalidInput(&'static str),

    /// Ring file creation failed
    Create(io::Error),

    /// Ring file open failed
    Open(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Range lock acquisition failed
    Lock(io::Error),

    /// msync of the mapping failed (rings created with the sync flag)
    Sync(io::Error),

    /// mlock of the mapping failed (rings created with the mlock flag)
    MemLock(io::Error),

    /// The file does not carry the ring magic
    BadMagic,

    /// Header fields fail validation at open
    Corrupt(&'static str),

    /// The next message does not fit the caller's buffer
    MsgTooBig {
        /// Bytes the next message occupies
        need: usize,
        /// Bytes remaining in the caller's buffer
        have: usize,
    },

    /// A descriptor registered via [`Ring::watch_fd`] became readable
    /// while the call was blocked. The ring state is unchanged.
    WatchedFdReady,

    /// Block/wake channel failure
    Bw(BwError),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(what) => write!(f, "invalid argument: {what}"),
            Self::Create(e) => write!(f, "ring file creation failed: {e}"),
            Self::Open(e) => write!(f, "ring file open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::Lock(e) => write!(f, "ring lock failed: {e}"),
            Self::Sync(e) => write!(f, "msync failed: {e}"),
            Self::MemLock(e) => write!(f, "mlock failed: {e}"),
            Self::BadMagic => write!(f, "not a ring file (bad magic)"),
            Self::Corrupt(what) => write!(f, "ring validation failed: {what}"),
            Self::MsgTooBig { need, have } => {
                write!(f, "message of {need} bytes exceeds buffer of {have} bytes")
            }
            Self::WatchedFdReady => write!(f, "watched descriptor ready"),
            Self::Bw(e) => write!(f, "block/wake channel: {e}"),
        }
    }
}

impl std::error::Error for RingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Create(e)
            | Self::Open(e)
            | Self::Mmap(e)
            | Self::Lock(e)
            | Self::Sync(e)
            | Self::MemLock(e) => Some(e),
            Self::Bw(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BwError> for RingError {
    fn from(e: BwError) -> Self {
        match e {
            BwError::WatchedFdReady => Self::WatchedFdReady,
            other => Self::Bw(other),
        }
    }
}

/// Result type for ring operations
pub type Result<T> = std::result::Result<T, RingError>;
