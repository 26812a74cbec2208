// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! # shmring — multi-process memory-mapped message ring
//!
//! A byte-framed message ring over a single mapped file, usable as an IPC
//! medium by unrelated processes on the same host. No daemon, no broker:
//! any process that can map the file participates. State — control
//! header, data area, message index and blocking-coordination records —
//! lives entirely inside the mapping; mutual exclusion is an advisory
//! range lock on the backing descriptor, which the kernel releases for
//! free when a process dies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shmring::{CreateOptions, Ring};
//!
//! fn main() -> shmring::Result<()> {
//!     Ring::create("/dev/shm/demo.ring", 1 << 20, &CreateOptions::default())?;
//!
//!     let mut writer = Ring::writer("/dev/shm/demo.ring").open()?;
//!     writer.write(b"hello")?;
//!
//!     let mut reader = Ring::reader("/dev/shm/demo.ring").open()?;
//!     let mut buf = [0u8; 64];
//!     let n = reader.read(&mut buf)?; // blocks until a message arrives
//!     assert_eq!(&buf[..n], b"hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Ring (handle)                         |
//! |  open/close, read/readv, write/writev, flush, stat, appdata  |
//! +--------------------------------------------------------------+
//! |                        ring engine                           |
//! |  mapped layout | message index | drop/reclaim | farm readers |
//! +--------------------------------------------------------------+
//! |  file range lock                |  block/wake channel (bw)   |
//! |  whole-ring mutual exclusion    |  abstract dgram sockets    |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modes
//!
//! - **Queue** (default): one logical consumer; reads remove messages.
//! - **Drop**: the writer reclaims unread eldest messages when full
//!   instead of blocking.
//! - **Farm** (implies drop): every reader observes every message;
//!   laggards are advanced past dropped messages and can count what they
//!   missed via [`Ring::farm_missed`].
//!
//! ## Blocking and event loops
//!
//! Blocking reads/writes suspend on a per-process datagram socket that
//! peers wake through names published in the mapped header. Non-blocking
//! readers instead export that socket via [`Ring::selectable_fd`] for
//! select/poll/epoll integration (spurious readiness possible — always
//! pair with non-blocking reads). Any blocking call can be interrupted
//! through a descriptor registered with [`Ring::watch_fd`] — a timerfd
//! for timeouts, a signalfd for shutdown.

pub mod bw;
pub mod ring;

pub use ring::{
    CreateOptions, MsgSpan, OpenOptions, ReadBatch, Ring, Result, RingError, RingStats,
};
