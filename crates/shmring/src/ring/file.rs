// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Backing file management: create/open, mmap, and the range lock.
//!
//! Every read or write of the shared state happens under an exclusive
//! whole-file `fcntl` range lock, since even readers adjust cursors in the
//! control header. The lock is acquired with a blocking wait; peers only
//! ever lock/manipulate/release in rapid succession, so acquisition is
//! quasi-bounded.
//!
//! POSIX record locks have two properties this module leans on:
//! - anything that closes the descriptor (including process death)
//!   releases the lock, and
//! - re-locking an already locked file, or unlocking an unlocked one, is
//!   a no-op rather than an error. Error paths can therefore run through
//!   an unconditional unlock.

use super::{Result, RingError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

const CREATE_MODE: u32 = 0o644;

/// An open, mapped ring file.
///
/// Unmaps and closes on drop. Does not unlink; ring files persist until
/// removed by their creator or an operator.
pub(crate) struct RingFile {
    file: File,
    base: *mut u8,
    size: usize,
    path: PathBuf,
}

// SAFETY: the mapping is shared memory coordinated by the file range lock;
// the RingFile itself holds no interior mutability beyond the raw mapping.
unsafe impl Send for RingFile {}

impl RingFile {
    /// Create a fresh ring file of exactly `size` bytes and map it.
    ///
    /// The file must not already exist (callers unlink beforehand).
    pub(crate) fn create(path: &Path, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(CREATE_MODE)
            .open(path)
            .map_err(|e| {
                log::error!("[RING] open {}: {e}", path.display());
                RingError::Create(e)
            })?;

        // ftruncate is unimplemented on hugetlbfs and fails with EINVAL
        // there; the mmap below sets the length in pages instead.
        if let Err(e) = file.set_len(size as u64) {
            if e.raw_os_error() != Some(libc::EINVAL) {
                log::error!("[RING] ftruncate {}: {e}", path.display());
                return Err(RingError::Create(e));
            }
        }

        let base = map_shared(&file, size, path)?;
        Ok(Self {
            file,
            base,
            size,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing ring file and map its full current size.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                log::error!("[RING] open {}: {e}", path.display());
                RingError::Open(e)
            })?;

        let size = file
            .metadata()
            .map_err(|e| {
                log::error!("[RING] stat {}: {e}", path.display());
                RingError::Open(e)
            })?
            .len() as usize;

        let base = map_shared(&file, size, path)?;
        Ok(Self {
            file,
            base,
            size,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the mapping to backing store.
    ///
    /// A no-op on tmpfs, the usual backing for a ring; only rings created
    /// with the sync flag call this.
    pub(crate) fn sync(&self) -> Result<()> {
        // SAFETY: base/size describe the live mapping created in
        // create()/open(); msync accepts any mapped range.
        let rc = unsafe { libc::msync(self.base.cast(), self.size, libc::MS_SYNC) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            log::error!("[RING] msync {}: {e}", self.path.display());
            return Err(RingError::Sync(e));
        }
        Ok(())
    }

    /// Prefault and pin the mapping in memory.
    pub(crate) fn mlock(&self) -> Result<()> {
        // SAFETY: base/size describe the live mapping.
        let rc = unsafe { libc::mlock(self.base.cast(), self.size) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            log::error!("[RING] mlock {}: {e}", self.path.display());
            return Err(RingError::MemLock(e));
        }
        Ok(())
    }
}

impl Drop for RingFile {
    fn drop(&mut self) {
        // SAFETY: base was returned by a successful mmap of `size` bytes
        // and drop runs at most once. The descriptor closes with `file`,
        // which also releases any range lock still held.
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

fn map_shared(file: &File, size: usize, path: &Path) -> Result<*mut u8> {
    // SAFETY:
    // - a null hint lets the kernel pick the address
    // - PROT_READ|PROT_WRITE with MAP_SHARED creates a mapping visible to
    //   every process that maps the same file
    // - the descriptor is valid for the duration of the call; the mapping
    //   holds its own reference afterwards
    // - MAP_FAILED is checked below
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let e = io::Error::last_os_error();
        log::error!("[RING] mmap {}: {e}", path.display());
        return Err(RingError::Mmap(e));
    }
    Ok(base.cast())
}

/// Exclusive range lock over the whole ring file.
///
/// Unlocks on drop, so every exit path from a locked region (including
/// `?` propagation) releases the lock. Closing the descriptor releases it
/// as well, which is what protects against peers dying mid-operation.
pub(crate) struct LockGuard {
    fd: RawFd,
}

/// Take the whole-file write lock, blocking until available.
///
/// fcntl locks are per-descriptor and re-acquiring is a no-op, so nested
/// acquisition by the same handle cannot deadlock.
pub(crate) fn lock(fd: RawFd) -> Result<LockGuard> {
    // SAFETY: plain data-carrying struct; zeroed then field-initialized.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as i16;
    fl.l_whence = libc::SEEK_SET as i16;

    // SAFETY: fd is a valid open descriptor owned by the calling handle;
    // F_SETLKW blocks until the lock is granted or a signal interrupts.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
    if rc < 0 {
        let e = io::Error::last_os_error();
        log::error!("[RING] fcntl lock: {e}");
        return Err(RingError::Lock(e));
    }
    Ok(LockGuard { fd })
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // SAFETY: see lock(); unlocking an unlocked region is not an error.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        // SAFETY: fd is still open (the guard never outlives the handle).
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLK, &fl) };
        if rc < 0 {
            log::error!("[RING] fcntl unlock: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().expect("tempdir");
        // Keep the dir alive by leaking it; test files are tiny.
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    #[test]
    fn create_open_roundtrip() {
        let path = scratch("ring.create");
        let f = RingFile::create(&path, 4096).expect("create");
        assert_eq!(f.size(), 4096);

        // SAFETY: the mapping is 4096 bytes; offsets 0 and 1 are in range.
        unsafe {
            *f.base() = 0x42;
            *f.base().add(1) = 0x43;
        }

        let g = RingFile::open(&path).expect("open");
        assert_eq!(g.size(), 4096);
        // SAFETY: same file, same size; bytes written above are visible.
        unsafe {
            assert_eq!(*g.base(), 0x42);
            assert_eq!(*g.base().add(1), 0x43);
        }
    }

    #[test]
    fn create_refuses_existing() {
        let path = scratch("ring.exists");
        let _f = RingFile::create(&path, 1024).expect("create");
        assert!(matches!(
            RingFile::create(&path, 1024),
            Err(RingError::Create(_))
        ));
    }

    #[test]
    fn open_missing_fails() {
        let path = scratch("ring.missing");
        assert!(matches!(RingFile::open(&path), Err(RingError::Open(_))));
    }

    #[test]
    fn lock_is_reentrant_per_descriptor() {
        let path = scratch("ring.lock");
        let f = RingFile::create(&path, 1024).expect("create");

        let g1 = lock(f.fd()).expect("lock");
        // Same descriptor: re-acquire is a no-op, not a deadlock.
        let g2 = lock(f.fd()).expect("relock");
        drop(g2);
        drop(g1);

        // Unlocking twice is fine as well.
        let g3 = lock(f.fd()).expect("lock again");
        drop(g3);
    }
}
