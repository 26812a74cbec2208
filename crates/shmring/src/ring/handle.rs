// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Per-process ring handle: creation, open, and the read/write engine.
//!
//! Every operation that touches the header, data area or message index
//! runs under the exclusive file range lock. Blocking callers release the
//! lock before suspending on the block/wake channel and re-acquire it on
//! retry; the lock guard's drop runs on every exit path, including `?`.
//!
//! # Write protocol (under lock)
//!
//! 1. verify free bytes and index slots, or reclaim (drop mode), or
//!    suspend on the reader-to-writer channel
//! 2. advance the eldest cursor past messages the write will overwrite
//! 3. per input buffer: record `(pos, len)` in the index slot
//!    `(e + mp) % mm`, copy the body (wrapping at `n`), advance `i`,
//!    `u`, `mp`, `m`
//! 4. wake the writer-to-reader channel, update stats
//!
//! # Read protocol (under lock)
//!
//! Non-farm reads consume: advance `r`, shrink `u` and `m`. Farm reads
//! advance only the handle's private sequence cursor, leaving the message
//! visible to other farm readers; a reader the producer has dropped past
//! first accounts the gap as missed messages.

use super::cache::WriteCache;
use super::file::{self, RingFile};
use super::layout::{default_max_msgs, MsgSlot, RingCtrl, StatBlock, MAGIC};
use super::{gflags, Result, RingError};
use crate::bw::{BwWaiter, BwWaker};
use std::io::IoSlice;
use std::mem;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Creation-time options for [`Ring::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Overwrite unread eldest messages when the ring is full
    pub drop_oldest: bool,
    /// Multi-reader broadcast semantics; implies `drop_oldest`
    pub farm: bool,
    /// msync the mapping at the end of every locked region
    pub sync: bool,
    /// mlock the mapping at open time
    pub mlock: bool,
    /// Accept an already-existing ring file as-is
    pub keep_existing: bool,
    /// Opaque bytes stored after the message index
    pub app_data: Option<Vec<u8>>,
    /// Index capacity in slots; `100 + size/100` when unset or zero
    pub max_msgs: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Read,
    Write,
}

/// Builder returned by [`Ring::reader`] / [`Ring::writer`].
#[derive(Debug)]
pub struct OpenOptions {
    path: PathBuf,
    dir: Dir,
    nonblock: bool,
    buffered: bool,
}

/// Extent of one decoded message within the caller's read buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgSpan {
    /// Byte offset into the buffer passed to `readv`
    pub off: usize,
    /// Message length
    pub len: usize,
}

/// Outcome of a [`Ring::readv`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadBatch {
    /// Total bytes copied out
    pub bytes: usize,
    /// Messages decoded (spans filled)
    pub msgs: usize,
}

/// Snapshot returned by [`Ring::stat`].
///
/// The period counters zero on reset; the live values reflect the ring at
/// the moment of the call regardless of resets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    /// Start of the current stats period
    pub start: Option<SystemTime>,
    /// Bytes written in the period
    pub bytes_written: usize,
    /// Bytes read in the period
    pub bytes_read: usize,
    /// Messages written in the period
    pub msgs_written: usize,
    /// Messages read in the period
    pub msgs_read: usize,
    /// Messages dropped in the period (drop mode)
    pub msgs_dropped: usize,
    /// Bytes dropped in the period (drop mode)
    pub bytes_dropped: usize,
    /// Data-area capacity in bytes
    pub ring_size: usize,
    /// Unread bytes in the ring right now
    pub unread_bytes: usize,
    /// Unread messages in the ring right now
    pub unread_msgs: usize,
    /// Index capacity in slots
    pub max_msgs: usize,
    /// Write cache capacity in bytes (0 if unbuffered)
    pub cache_size: usize,
    /// Messages currently cached
    pub cache_msgs: usize,
    /// Bytes currently cached
    pub cache_bytes: usize,
    /// Ring created in drop mode
    pub drop_mode: bool,
    /// Ring created in farm mode
    pub farm: bool,
    /// Ring msyncs every locked region
    pub sync: bool,
    /// Ring is mlocked at open
    pub mlock: bool,
    /// App-data region length
    pub app_len: usize,
}

/// A per-process handle onto a shared ring, opened for reading xor
/// writing.
///
/// One handle is single-threaded: the shared state is protected by the
/// file lock, the handle struct is not. Wrap it in a mutex to share
/// within a process.
pub struct Ring {
    // Channel endpoints precede the file so an aborted open can release
    // them while the mapping is still alive.
    waiter: Option<BwWaiter>,
    waker: Option<BwWaker>,
    cache: Option<WriteCache>,
    dir: Dir,
    nonblock: bool,
    /// Farm cursor: sequence number of this reader's next message
    q_local: usize,
    /// Messages the producer dropped past this farm reader
    missed: usize,
    /// Copy of the immutable data-area size, usable without the lock
    n: usize,
    /// Copy of the immutable index capacity, usable without the lock
    mm: usize,
    file: RingFile,
}

impl Ring {
    /// Create a ring file of `data_size` data bytes at `path`.
    ///
    /// With `keep_existing`, an already-present file is accepted as-is;
    /// otherwise any existing file is replaced atomically-enough by
    /// unlink + exclusive create.
    pub fn create<P: AsRef<Path>>(path: P, data_size: usize, opts: &CreateOptions) -> Result<()> {
        let path = path.as_ref();
        if data_size == 0 {
            return Err(RingError::InvalidInput("data size must be nonzero"));
        }

        let app = opts.app_data.as_deref().unwrap_or(&[]);
        let max_msgs = match opts.max_msgs {
            Some(0) | None => default_max_msgs(data_size),
            Some(m) => m,
        };
        let mv_len = max_msgs * mem::size_of::<MsgSlot>();
        let pad = RingCtrl::index_padding(data_size);

        if path.exists() {
            if opts.keep_existing {
                return Ok(());
            }
            std::fs::remove_file(path).map_err(|e| {
                log::error!("[RING] unlink {}: {e}", path.display());
                RingError::Create(e)
            })?;
        }

        let total = RingCtrl::size() + data_size + pad + mv_len + app.len();
        let ringfile = match RingFile::create(path, total) {
            Ok(f) => f,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };
        let res = init_header(&ringfile, data_size, pad, max_msgs, mv_len, app, opts);
        if res.is_err() {
            let _ = std::fs::remove_file(path);
        }
        res
    }

    /// Start opening `path` for reading.
    pub fn reader<P: AsRef<Path>>(path: P) -> OpenOptions {
        OpenOptions {
            path: path.as_ref().to_path_buf(),
            dir: Dir::Read,
            nonblock: false,
            buffered: false,
        }
    }

    /// Start opening `path` for writing.
    pub fn writer<P: AsRef<Path>>(path: P) -> OpenOptions {
        OpenOptions {
            path: path.as_ref().to_path_buf(),
            dir: Dir::Write,
            nonblock: false,
            buffered: false,
        }
    }

    #[inline]
    fn ctrl_ptr(&self) -> *mut RingCtrl {
        self.file.base().cast()
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the data area begins immediately after the header; the
        // mapping was validated to cover header + n + index at open.
        unsafe { self.file.base().add(RingCtrl::size()) }
    }

    #[inline]
    fn index_ptr(&self) -> *mut MsgSlot {
        // SAFETY: in-bounds per the validated layout; the index begins
        // after the data area plus its alignment padding.
        unsafe {
            self.file
                .base()
                .add(RingCtrl::size() + self.n + RingCtrl::index_padding(self.n))
                .cast()
        }
    }

    fn sync_if_flagged(&self) -> Result<()> {
        // SAFETY: header read under the lock held by the caller.
        let flags = unsafe { (*self.ctrl_ptr()).gflags };
        if flags & gflags::SYNC != 0 {
            self.file.sync()?;
        }
        Ok(())
    }

    /// Locate the next readable message, applying the farm laggard
    /// adjustment. Called under the lock.
    fn next_msg(&mut self) -> Option<(usize, usize)> {
        // SAFETY: lock held; ctrl points at the mapped header.
        let ctrl = unsafe { &mut *self.ctrl_ptr() };
        let farm = ctrl.gflags & gflags::FARM != 0;

        // A farm reader whose next sequence has been dropped from the
        // ring resumes at the eldest and accounts the gap as missed.
        if farm && self.q_local < ctrl.q {
            self.missed += ctrl.q - self.q_local;
            self.q_local = ctrl.q;
        }

        let ready = if farm {
            self.q_local < ctrl.q + ctrl.mp
        } else {
            ctrl.m > 0
        };
        if !ready {
            return None;
        }

        let slot = if farm { self.q_local % ctrl.mm } else { ctrl.r };
        // SAFETY: slot < mm; the index entry was written under the lock.
        let mv = unsafe { *self.index_ptr().add(slot) };
        Some((mv.pos, mv.len))
    }

    fn copy_out(&self, pos: usize, len: usize, dst: &mut [u8]) {
        debug_assert!(len <= dst.len());
        let (l1, wrapped) = split_at_wrap(self.n, pos, len);
        // SAFETY: pos/len come from an index slot maintained under the
        // lock, so both extents lie within the data area; dst is at least
        // len bytes; shared mapping and caller buffer never overlap.
        unsafe {
            ptr::copy_nonoverlapping(self.data_ptr().add(pos), dst.as_mut_ptr(), l1);
            if let Some(l2) = wrapped {
                ptr::copy_nonoverlapping(self.data_ptr(), dst.as_mut_ptr().add(l1), l2);
            }
        }
    }

    fn copy_in(&self, pos: usize, src: &[u8]) {
        let (l1, wrapped) = split_at_wrap(self.n, pos, src.len());
        // SAFETY: the write path verified src fits the free region before
        // this copy; extents lie within the data area.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(pos), l1);
            if let Some(l2) = wrapped {
                ptr::copy_nonoverlapping(src.as_ptr().add(l1), self.data_ptr(), l2);
            }
        }
    }

    /// Read one message into `buf`.
    ///
    /// Returns the message length, or `Ok(0)` when a non-blocking handle
    /// finds the ring empty.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut spans = [MsgSpan::default(); 1];
        self.readv(buf, &mut spans).map(|b| b.bytes)
    }

    /// Read as many whole messages as fit `buf` and `spans`, one span per
    /// message.
    ///
    /// Blocks when the ring is empty unless the handle is non-blocking
    /// (then returns an empty batch). Fails with
    /// [`RingError::MsgTooBig`] if the first pending message alone
    /// exceeds `buf`, and with [`RingError::WatchedFdReady`] if an
    /// ancillary descriptor fired while blocked.
    pub fn readv(&mut self, buf: &mut [u8], spans: &mut [MsgSpan]) -> Result<ReadBatch> {
        if self.dir != Dir::Read {
            return Err(RingError::InvalidInput("read on a write handle"));
        }
        if buf.is_empty() {
            return Err(RingError::InvalidInput("zero-length read buffer"));
        }
        if spans.is_empty() {
            return Err(RingError::InvalidInput("empty span array"));
        }
        let cap = buf.len().min(isize::MAX as usize);

        // Test or await data availability.
        let _lk = loop {
            let lk = file::lock(self.file.fd())?;
            if self.next_msg().is_some() {
                break lk;
            }
            if self.nonblock {
                if let Some(w) = self.waiter.as_mut() {
                    w.force(false)?;
                }
                return Ok(ReadBatch::default());
            }
            drop(lk);
            match self.waiter.as_mut() {
                Some(w) => w.wait()?,
                None => {
                    return Err(RingError::InvalidInput("blocking read without wait channel"))
                }
            }
        };

        let farm = {
            // SAFETY: lock held.
            unsafe { (*self.ctrl_ptr()).gflags & gflags::FARM != 0 }
        };

        let mut nr = 0usize;
        let mut mc = 0usize;
        let mut first_need = 0usize;
        let mut pending = self.next_msg();

        while let Some((pos, len)) = pending {
            if mc == spans.len() {
                break;
            }
            if len > cap - nr {
                if mc == 0 {
                    first_need = len;
                }
                break;
            }

            self.copy_out(pos, len, &mut buf[nr..nr + len]);
            spans[mc] = MsgSpan { off: nr, len };
            nr += len;
            mc += 1;

            if farm {
                self.q_local += 1;
            } else {
                // SAFETY: lock held.
                let ctrl = unsafe { &mut *self.ctrl_ptr() };
                ctrl.r = (ctrl.r + 1) % ctrl.mm;
                ctrl.u -= len;
                ctrl.m -= 1;
            }

            pending = self.next_msg();
        }

        {
            // SAFETY: lock held.
            let ctrl = unsafe { &mut *self.ctrl_ptr() };
            ctrl.stat.br += nr;
            ctrl.stat.mr += mc;
        }

        if nr > 0 {
            // Space freed (or progress made): wake blocked writers. Wake
            // errors were already logged and do not fail the read.
            if let Some(wk) = self.waker.as_mut() {
                let _ = wk.wake();
            }
        }

        // Reconcile the listener with "is a message still ready".
        let more = pending.is_some();
        if let Some(w) = self.waiter.as_mut() {
            w.force(more)?;
        }
        self.sync_if_flagged()?;

        if mc == 0 {
            return Err(RingError::MsgTooBig {
                need: first_need,
                have: cap,
            });
        }
        Ok(ReadBatch { bytes: nr, msgs: mc })
    }

    /// Write one message. All-or-nothing; `Ok(0)` means a non-blocking
    /// handle found insufficient room.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writev(&[IoSlice::new(buf)])
    }

    /// Write a batch of messages, one per slice. All-or-nothing.
    ///
    /// Buffered handles sink into the write cache when it fits; a full
    /// cache is flushed first. Blocks when the ring lacks room unless the
    /// ring drops (reclaim) or the handle is non-blocking (`Ok(0)`).
    pub fn writev(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        if self.dir != Dir::Write {
            return Err(RingError::InvalidInput("write on a read handle"));
        }
        let niov = bufs.len();
        let mut len = 0usize;
        for b in bufs {
            if b.is_empty() {
                return Err(RingError::InvalidInput("zero-length message"));
            }
            len += b.len();
        }
        if len == 0 {
            return Err(RingError::InvalidInput("nothing to write"));
        }
        if len > isize::MAX as usize {
            return Err(RingError::InvalidInput("write exceeds SSIZE_MAX"));
        }
        if len > self.n {
            return Err(RingError::InvalidInput("write exceeds ring capacity"));
        }
        if niov > self.mm {
            return Err(RingError::InvalidInput("more messages than index slots"));
        }

        loop {
            let Some(c) = self.cache.as_mut() else { break };
            if c.fits(len, niov) {
                for b in bufs {
                    c.push(b);
                }
                return Ok(len);
            }
            if c.is_empty() {
                // Larger than the cache: conduct directly.
                break;
            }
            let flushed = self.flush_cache()?;
            if flushed == 0 {
                return Ok(0);
            }
        }

        self.write_direct(bufs, len)
    }

    fn write_direct(&mut self, bufs: &[IoSlice<'_>], len: usize) -> Result<usize> {
        let niov = bufs.len();

        let _lk = loop {
            let lk = file::lock(self.file.fd())?;
            // SAFETY: lock held.
            let (free_bytes, free_slots, drop_mode) = {
                let ctrl = unsafe { &*self.ctrl_ptr() };
                (
                    ctrl.n - ctrl.u,
                    ctrl.mm - ctrl.m,
                    ctrl.gflags & gflags::DROP != 0,
                )
            };
            if free_bytes >= len && free_slots >= niov {
                break lk;
            }
            if drop_mode {
                self.reclaim(len, niov);
                break lk;
            }
            if self.nonblock {
                return Ok(0);
            }
            drop(lk);
            match self.waiter.as_mut() {
                Some(w) => w.wait()?,
                None => {
                    return Err(RingError::InvalidInput("blocking write without wait channel"))
                }
            }
        };

        // Overwriting still-present eldest bodies (farm rings where reads
        // do not free space) advances the eldest cursor first.
        self.advance_eldest(len);

        for b in bufs {
            let bsz = b.len();
            // SAFETY: lock held.
            let ctrl = unsafe { &mut *self.ctrl_ptr() };
            let slot = (ctrl.e + ctrl.mp) % ctrl.mm;
            let pos = ctrl.i;
            // SAFETY: slot < mm; index writes are serialized by the lock.
            unsafe {
                *self.index_ptr().add(slot) = MsgSlot { pos, len: bsz };
            }
            self.copy_in(pos, b);
            let ctrl = unsafe { &mut *self.ctrl_ptr() };
            ctrl.i = (ctrl.i + bsz) % ctrl.n;
            ctrl.u += bsz;
            ctrl.mp += 1;
            ctrl.m += 1;
        }

        if let Some(wk) = self.waker.as_mut() {
            wk.wake()?;
        }

        {
            // SAFETY: lock held.
            let ctrl = unsafe { &mut *self.ctrl_ptr() };
            ctrl.stat.bw += len;
            ctrl.stat.mw += niov;
        }
        self.sync_if_flagged()?;
        Ok(len)
    }

    /// Drop eldest messages until `need` bytes and `niov` index slots are
    /// free. Called under the lock; only drop-mode rings reach here.
    fn reclaim(&mut self, need: usize, niov: usize) {
        // SAFETY: lock held.
        let ctrl = unsafe { &mut *self.ctrl_ptr() };
        debug_assert!(ctrl.gflags & gflags::DROP != 0);
        debug_assert!(ctrl.mm >= niov);
        debug_assert!(ctrl.m <= ctrl.mp);
        debug_assert!(ctrl.mp > 0);

        let avail_bytes = ctrl.n - ctrl.u;
        let avail_slots = ctrl.mm - ctrl.m;

        let mut dropped = 0usize;
        let mut freed = 0usize;
        let mut e = ctrl.e;

        while need > avail_bytes + freed {
            // SAFETY: e < mm.
            freed += unsafe { (*self.index_ptr().add(e)).len };
            dropped += 1;
            e = (e + 1) % ctrl.mm;
        }
        while niov > avail_slots + dropped {
            // SAFETY: e < mm.
            freed += unsafe { (*self.index_ptr().add(e)).len };
            dropped += 1;
            e = (e + 1) % ctrl.mm;
        }

        ctrl.u = ctrl.u.saturating_sub(freed);
        ctrl.stat.bd += freed;
        ctrl.stat.md += dropped;
        ctrl.mp = ctrl.mp.saturating_sub(dropped);
        ctrl.m = ctrl.m.saturating_sub(dropped);
        ctrl.r = (ctrl.r + dropped) % ctrl.mm;
        ctrl.e = (ctrl.e + dropped) % ctrl.mm;
        ctrl.q += dropped;

        debug_assert!(ctrl.n - ctrl.u >= need);
        debug_assert!(ctrl.mm - ctrl.m >= niov);
    }

    /// Advance the eldest cursor past every still-present message whose
    /// body the next `len`-byte write will overwrite. Called under the
    /// lock; both extents may wrap.
    fn advance_eldest(&mut self, len: usize) {
        // SAFETY: lock held.
        let ctrl = unsafe { &mut *self.ctrl_ptr() };
        while ctrl.mp > 0 {
            // SAFETY: e < mm.
            let MsgSlot { pos: ep, len: el } = unsafe { *self.index_ptr().add(ctrl.e) };
            let eldest_end = (ep + el) % ctrl.n;
            let write_end = (ctrl.i + len) % ctrl.n;

            let starts_inside = ctrl.i >= ep && ctrl.i < eldest_end;
            let ends_inside = write_end > ep && write_end <= eldest_end;
            if !starts_inside && !ends_inside {
                break;
            }

            ctrl.e = (ctrl.e + 1) % ctrl.mm;
            ctrl.mp -= 1;
            ctrl.q += 1;
        }
    }

    /// Flush the write cache into the ring.
    ///
    /// With `wait`, a non-blocking handle performs a blocking flush,
    /// lazily opening its wait channel if it never had one. Without it, a
    /// non-blocking flush returns `Ok(0)` when the ring lacks room and
    /// the cache is kept.
    pub fn flush(&mut self, wait: bool) -> Result<usize> {
        if self.dir != Dir::Write {
            return Err(RingError::InvalidInput("flush on a read handle"));
        }
        if self.cache.as_ref().map_or(true, WriteCache::is_empty) {
            return Ok(0);
        }

        let toggled = self.nonblock && wait;
        if toggled {
            self.nonblock = false;
            if self.waiter.is_none() {
                if let Err(e) = self.open_write_waiter() {
                    self.nonblock = true;
                    return Err(e);
                }
            }
        }

        let res = self.flush_cache();
        if toggled {
            self.nonblock = true;
        }
        res
    }

    fn open_write_waiter(&mut self) -> Result<()> {
        let _lk = file::lock(self.file.fd())?;
        // SAFETY: lock held; the record lives in the mapped header.
        let rec = unsafe { ptr::addr_of_mut!((*self.ctrl_ptr()).r2w) };
        self.waiter = Some(BwWaiter::open(rec)?);
        Ok(())
    }

    fn flush_cache(&mut self) -> Result<usize> {
        let Some(mut c) = self.cache.take() else {
            return Ok(0);
        };
        if c.is_empty() {
            self.cache = Some(c);
            return Ok(0);
        }

        let res = {
            let slices: Vec<IoSlice<'_>> = c.messages().map(IoSlice::new).collect();
            let total: usize = slices.iter().map(|s| s.len()).sum();
            self.write_direct(&slices, total)
        };
        if matches!(&res, Ok(n) if *n > 0) {
            c.clear();
        }
        self.cache = Some(c);
        res
    }

    /// Snapshot ring statistics; with `reset`, zero the period counters
    /// and stamp the new period start.
    pub fn stat(&mut self, reset: Option<SystemTime>) -> Result<RingStats> {
        let _lk = file::lock(self.file.fd())?;
        // SAFETY: lock held.
        let ctrl = unsafe { &mut *self.ctrl_ptr() };

        let start = if ctrl.stat.start_sec == 0 && ctrl.stat.start_usec == 0 {
            None
        } else {
            Some(
                UNIX_EPOCH
                    + Duration::new(
                        ctrl.stat.start_sec.max(0) as u64,
                        (ctrl.stat.start_usec.max(0) as u32) * 1000,
                    ),
            )
        };

        let stats = RingStats {
            start,
            bytes_written: ctrl.stat.bw,
            bytes_read: ctrl.stat.br,
            msgs_written: ctrl.stat.mw,
            msgs_read: ctrl.stat.mr,
            msgs_dropped: ctrl.stat.md,
            bytes_dropped: ctrl.stat.bd,
            ring_size: ctrl.n,
            unread_bytes: ctrl.u,
            unread_msgs: ctrl.m,
            max_msgs: ctrl.mm,
            cache_size: self.cache.as_ref().map_or(0, WriteCache::capacity),
            cache_msgs: self.cache.as_ref().map_or(0, WriteCache::msg_count),
            cache_bytes: self.cache.as_ref().map_or(0, WriteCache::byte_count),
            drop_mode: ctrl.gflags & gflags::DROP != 0,
            farm: ctrl.gflags & gflags::FARM != 0,
            sync: ctrl.gflags & gflags::SYNC != 0,
            mlock: ctrl.gflags & gflags::MLOCK != 0,
            app_len: ctrl.app_len,
        };

        if let Some(t) = reset {
            ctrl.stat = StatBlock::default();
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            ctrl.stat.start_sec = d.as_secs() as i64;
            ctrl.stat.start_usec = i64::from(d.subsec_micros());
        }

        self.sync_if_flagged()?;
        Ok(stats)
    }

    /// Messages this farm reader has missed (dropped by the producer
    /// before this reader reached them). Updated at read time. With
    /// `reset`, the counter restarts at zero.
    pub fn farm_missed(&mut self, reset: bool) -> usize {
        debug_assert!(self.dir == Dir::Read);
        let d = self.missed;
        if reset {
            self.missed = 0;
        }
        d
    }

    /// Copy out the app-data region.
    pub fn appdata(&mut self) -> Result<Vec<u8>> {
        let _lk = file::lock(self.file.fd())?;
        let (app_len, off) = self.appdata_extent()?;
        let mut out = vec![0u8; app_len];
        // SAFETY: the app-data region is within the validated mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.file.base().add(off), out.as_mut_ptr(), app_len);
        }
        self.sync_if_flagged()?;
        Ok(out)
    }

    /// Overwrite the app-data region; `data` must match its length.
    pub fn set_appdata(&mut self, data: &[u8]) -> Result<()> {
        let _lk = file::lock(self.file.fd())?;
        let (app_len, off) = self.appdata_extent()?;
        if data.len() != app_len {
            return Err(RingError::InvalidInput("app data length mismatch"));
        }
        // SAFETY: as in appdata().
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.file.base().add(off), app_len);
        }
        self.sync_if_flagged()?;
        Ok(())
    }

    /// Atomically read the current app data and replace it with `data`
    /// (same length) in one locked region.
    pub fn swap_appdata(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let _lk = file::lock(self.file.fd())?;
        let (app_len, off) = self.appdata_extent()?;
        if data.len() != app_len {
            return Err(RingError::InvalidInput("app data length mismatch"));
        }
        let mut out = vec![0u8; app_len];
        // SAFETY: as in appdata().
        unsafe {
            let ad = self.file.base().add(off);
            ptr::copy_nonoverlapping(ad, out.as_mut_ptr(), app_len);
            ptr::copy_nonoverlapping(data.as_ptr(), ad, app_len);
        }
        self.sync_if_flagged()?;
        Ok(out)
    }

    fn appdata_extent(&self) -> Result<(usize, usize)> {
        // SAFETY: lock held by caller.
        let ctrl = unsafe { &*self.ctrl_ptr() };
        if ctrl.app_len == 0 {
            return Err(RingError::InvalidInput("ring has no app data"));
        }
        Ok((ctrl.app_len, ctrl.appdata_offset()))
    }

    /// Descriptor usable with select/poll/epoll.
    ///
    /// Defined only for non-blocking read handles: spurious readiness is
    /// possible (coalesced reads leave extra wakeups), so a woken caller
    /// must be able to get `Ok(0)` back from `read` without blocking.
    /// Writers cannot poll externally for space.
    #[must_use]
    pub fn selectable_fd(&self) -> Option<RawFd> {
        if self.dir == Dir::Read && self.nonblock {
            self.waiter.as_ref().map(BwWaiter::poll_fd)
        } else {
            None
        }
    }

    /// Register an ancillary descriptor (timerfd, signalfd, pipe) on the
    /// blocking wait set. A blocked `read`/`write`/`flush` returns
    /// [`RingError::WatchedFdReady`] when it becomes readable.
    ///
    /// A handle that can never block (non-blocking or drop-mode writer)
    /// has no wait set; the registration is a no-op then.
    pub fn watch_fd(&mut self, fd: RawFd) -> Result<()> {
        match self.waiter.as_mut() {
            Some(w) => {
                w.watch_fd(fd)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Close the handle: best-effort cache flush, slot release, unmap.
    /// Dropping the handle does the same.
    pub fn close(self) {}
}

impl Drop for Ring {
    fn drop(&mut self) {
        if self.cache.as_ref().is_some_and(|c| !c.is_empty()) {
            if let Err(e) = self.flush_cache() {
                log::warn!("[RING] close flush: {e}");
            }
        }

        match file::lock(self.file.fd()) {
            Ok(lk) => {
                // Waiter drop clears its slot in the shared record, which
                // must happen under the lock.
                self.waiter = None;
                self.waker = None;
                drop(lk);
            }
            Err(e) => {
                log::warn!("[RING] close: {e}");
                // Slot release requires the lock; without it the endpoint
                // is leaked and peers prune the slot via liveness checks.
                if let Some(w) = self.waiter.take() {
                    mem::forget(w);
                }
                self.waker = None;
            }
        }
        // RingFile drop unmaps and closes, releasing any residual lock.
    }
}

impl OpenOptions {
    /// Fail immediately with `Ok(0)` instead of blocking when the ring is
    /// empty (reads) or full (writes).
    #[must_use]
    pub fn nonblock(mut self, yes: bool) -> Self {
        self.nonblock = yes;
        self
    }

    /// Cache writes in process-local memory; flushed when full, on
    /// [`Ring::flush`] and at close. Write handles only.
    #[must_use]
    pub fn buffered(mut self, yes: bool) -> Self {
        self.buffered = yes;
        self
    }

    /// Open the ring.
    pub fn open(self) -> Result<Ring> {
        let file = RingFile::open(&self.path)?;
        let lk = file::lock(file.fd())?;

        let ctrl_ptr: *mut RingCtrl = file.base().cast();
        let (n, mm, gf, q) = {
            // SAFETY: lock held; validate() checks the header before any
            // field is trusted.
            let ctrl = unsafe { &*ctrl_ptr };
            ctrl.validate(file.size() as u64)?;
            (ctrl.n, ctrl.mm, ctrl.gflags, ctrl.q)
        };

        if gf & gflags::MLOCK != 0 {
            file.mlock()?;
        }

        let mut ring = Ring {
            waiter: None,
            waker: None,
            cache: None,
            dir: self.dir,
            nonblock: self.nonblock,
            q_local: q,
            missed: 0,
            n,
            mm,
            file,
        };

        match ring.open_channels(self.buffered) {
            Ok(()) => {
                drop(lk);
                Ok(ring)
            }
            Err(e) => {
                // Still under the lock: release any slot already claimed.
                ring.waiter = None;
                ring.waker = None;
                drop(lk);
                Err(e)
            }
        }
    }
}

impl Ring {
    fn open_channels(&mut self, buffered: bool) -> Result<()> {
        let ctrl = self.ctrl_ptr();
        match self.dir {
            Dir::Read => {
                // SAFETY: lock held by the caller; records live in the
                // mapped header.
                let w2r = unsafe { ptr::addr_of_mut!((*ctrl).w2r) };
                let r2w = unsafe { ptr::addr_of_mut!((*ctrl).r2w) };
                let mut waiter = BwWaiter::open(w2r)?;
                let waker = BwWaker::open(r2w)?;
                // SAFETY: lock held.
                let has_data = unsafe { (*ctrl).u > 0 };
                waiter.force(has_data)?;
                self.waiter = Some(waiter);
                self.waker = Some(waker);
            }
            Dir::Write => {
                // SAFETY: as above.
                let w2r = unsafe { ptr::addr_of_mut!((*ctrl).w2r) };
                self.waker = Some(BwWaker::open(w2r)?);

                // A writer that can never block skips the wait channel,
                // sparing readers the obligation to send free-space
                // wakeups to it. A later blocking flush opens it lazily.
                // SAFETY: lock held.
                let drop_mode = unsafe { (*ctrl).gflags & gflags::DROP != 0 };
                if !self.nonblock && !drop_mode {
                    let r2w = unsafe { ptr::addr_of_mut!((*ctrl).r2w) };
                    self.waiter = Some(BwWaiter::open(r2w)?);
                }
            }
        }

        if buffered && self.dir == Dir::Write {
            self.cache = Some(WriteCache::new(self.n, self.mm));
        }
        self.sync_if_flagged()
    }
}

fn init_header(
    file: &RingFile,
    data_size: usize,
    pad: usize,
    max_msgs: usize,
    mv_len: usize,
    app: &[u8],
    opts: &CreateOptions,
) -> Result<()> {
    let _lk = file::lock(file.fd())?;

    // SAFETY: fresh exclusive file, mapping covers at least the header.
    unsafe {
        ptr::write_bytes(file.base(), 0, RingCtrl::size());
    }
    // SAFETY: header region zeroed above; no other process can hold the
    // lock on a file that did not exist a moment ago.
    let ctrl = unsafe { &mut *file.base().cast::<RingCtrl>() };
    ctrl.magic = MAGIC;
    ctrl.mm = max_msgs;
    ctrl.pad_len = pad;
    ctrl.mv_len = mv_len;
    ctrl.app_len = app.len();
    ctrl.n = data_size;

    let mut gf = 0u32;
    if opts.sync {
        gf |= gflags::SYNC;
    }
    if opts.drop_oldest {
        gf |= gflags::DROP;
    }
    if opts.farm {
        gf |= gflags::FARM | gflags::DROP;
    }
    if opts.mlock {
        gf |= gflags::MLOCK;
    }
    if opts.app_data.is_some() {
        gf |= gflags::APPDATA;
    }
    ctrl.gflags = gf;

    if !app.is_empty() {
        // SAFETY: the app region is within the file size computed by
        // create(); the source is a caller slice.
        unsafe {
            ptr::copy_nonoverlapping(
                app.as_ptr(),
                file.base().add(ctrl.appdata_offset()),
                app.len(),
            );
        }
    }
    Ok(())
}

/// Split a body of `len` bytes at data-area offset `pos` into its
/// in-place prefix and (when it wraps past `n`) the wrapped remainder.
fn split_at_wrap(n: usize, pos: usize, len: usize) -> (usize, Option<usize>) {
    if pos + len > n {
        let l1 = n - pos;
        (l1, Some(len - l1))
    } else {
        (len, None)
    }
}
