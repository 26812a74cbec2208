// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Write-side cache for buffered handles.
//!
//! Buffered writers sink small writes here and flush in one locked pass,
//! trading latency for far fewer lock acquisitions on the ring. The cache
//! is bounded so its entire content can always be flushed at once into an
//! empty ring: at most `n` bytes and at most `mm` message entries.

/// Upper bound on the cache byte buffer (1 GiB).
const MAX_CACHE_BYTES: usize = 1024 * 1024 * 1024;

/// Upper bound on cached message entries.
const MAX_CACHE_MSGS: usize = 10_000;

/// Byte buffer plus message extents, owned by a buffered write handle.
pub(crate) struct WriteCache {
    buf: Vec<u8>,
    used: usize,
    /// Cached message extents into `buf`: (offset, length)
    msgs: Vec<(usize, usize)>,
    msg_cap: usize,
}

impl WriteCache {
    /// Size the cache for a ring of `n` data bytes and `mm` index slots:
    /// a tenth of the ring, clamped so tiny rings get a full-ring cache
    /// and huge rings stay bounded.
    pub(crate) fn new(n: usize, mm: usize) -> Self {
        let mut sz = n / 10;
        if sz > MAX_CACHE_BYTES {
            sz = MAX_CACHE_BYTES;
        }
        if sz < 1024 {
            sz = n;
        }
        let msg_cap = MAX_CACHE_MSGS.min(mm);
        Self {
            buf: vec![0u8; sz],
            used: 0,
            msgs: Vec::with_capacity(msg_cap),
            msg_cap,
        }
    }

    /// Can `len` more bytes across `niov` more messages be cached?
    pub(crate) fn fits(&self, len: usize, niov: usize) -> bool {
        len <= self.buf.len() - self.used && niov <= self.msg_cap - self.msgs.len()
    }

    /// Append one message. Caller checks `fits` first.
    pub(crate) fn push(&mut self, msg: &[u8]) {
        debug_assert!(self.fits(msg.len(), 1));
        let off = self.used;
        self.buf[off..off + msg.len()].copy_from_slice(msg);
        self.msgs.push((off, msg.len()));
        self.used += msg.len();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Cached message extents, in insertion order.
    pub(crate) fn messages(&self) -> impl Iterator<Item = &[u8]> {
        self.msgs.iter().map(|&(off, len)| &self.buf[off..off + len])
    }

    pub(crate) fn clear(&mut self) {
        self.used = 0;
        self.msgs.clear();
    }

    /// Cache capacity in bytes
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Cached message count
    pub(crate) fn msg_count(&self) -> usize {
        self.msgs.len()
    }

    /// Cached byte count
    pub(crate) fn byte_count(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_ring_gets_full_ring_cache() {
        let c = WriteCache::new(64, 10);
        assert_eq!(c.capacity(), 64);
    }

    #[test]
    fn big_ring_gets_tenth() {
        let c = WriteCache::new(1 << 20, 100);
        assert_eq!(c.capacity(), (1 << 20) / 10);
    }

    #[test]
    fn msg_cap_clamped_by_index() {
        let c = WriteCache::new(1 << 20, 7);
        assert!(c.fits(1, 7));
        assert!(!c.fits(1, 8));
    }

    #[test]
    fn push_and_drain() {
        let mut c = WriteCache::new(64, 10);
        assert!(c.is_empty());

        c.push(b"hello");
        c.push(b"world");
        assert_eq!(c.byte_count(), 10);
        assert_eq!(c.msg_count(), 2);
        assert!(!c.is_empty());

        let msgs: Vec<&[u8]> = c.messages().collect();
        assert_eq!(msgs, vec![b"hello".as_slice(), b"world".as_slice()]);

        c.clear();
        assert!(c.is_empty());
        assert!(c.fits(64, 10));
    }

    #[test]
    fn fits_accounts_for_bytes_and_slots() {
        let mut c = WriteCache::new(64, 2);
        c.push(b"0123456789");
        assert!(c.fits(54, 1));
        assert!(!c.fits(55, 1));
        c.push(b"x");
        assert!(!c.fits(1, 1));
    }
}
