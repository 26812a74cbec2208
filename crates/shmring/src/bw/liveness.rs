// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Peer liveness checks via /proc.
//!
//! A shared slot names a pid and an abstract socket. Deciding whether the
//! slot is stale takes two steps: a zero-signal probes the pid, then the
//! pid's open socket inodes (from `/proc/<pid>/fd`) are matched against
//! the system-wide abstract socket table (`/proc/net/unix`) to confirm
//! the process still owns a socket of that name.
//!
//! Inconclusive results must leave the slot alone, so every failure path
//! here maps to [`Liveness::Unknown`] rather than an error.

use super::{BwSlot, BW_NAMELEN};
use std::fs;

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The pid exists and owns a socket of the expected name
    Alive,
    /// The pid is gone, or it provably does not own the socket
    Dead,
    /// Could not tell; leave the slot alone
    Unknown,
}

/// Does `pid` exist and hold open an abstract domain socket named `name`?
///
/// `name` is the friendly form stored in a slot: `@xxxxx`, NUL-padded.
#[must_use]
pub fn has_pid_socket(pid: libc::pid_t, name: &[u8; BW_NAMELEN]) -> Liveness {
    // Existence probe; signal 0 sends nothing.
    // SAFETY: kill with signal 0 only performs permission/existence checks.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
        return Liveness::Dead;
    }

    let inodes = match socket_inodes(pid) {
        Some(v) => v,
        None => return Liveness::Unknown,
    };

    has_socket_name(&inodes, slot_name_str(name))
}

fn slot_name_str(name: &[u8; BW_NAMELEN]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(BW_NAMELEN);
    std::str::from_utf8(&name[..end]).unwrap_or("")
}

/// Collect the socket inodes of a pid's open descriptors.
///
/// `/proc/<pid>/fd` entries are symlinks; socket descriptors read as
/// `socket:[39882]` where the bracketed number is the inode.
fn socket_inodes(pid: libc::pid_t) -> Option<Vec<u64>> {
    let dir = format!("/proc/{pid}/fd");
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::PermissionDenied {
                log::debug!("[BW] opendir {dir}: {e}");
            }
            return None;
        }
    };

    let mut inodes = Vec::new();
    for entry in entries {
        let entry = entry.ok()?;
        let target = match fs::read_link(entry.path()) {
            Ok(t) => t,
            // Descriptors come and go while we scan; a vanished one is fine.
            Err(_) => continue,
        };
        let target = target.to_string_lossy();
        if let Some(num) = target
            .strip_prefix("socket:[")
            .and_then(|s| s.strip_suffix(']'))
        {
            inodes.push(num.parse().ok()?);
        }
    }
    Some(inodes)
}

/// Is any inode in the list bound to an abstract socket of this name?
///
/// `/proc/net/unix` lines look like:
///
/// ```text
/// Num       RefCount Protocol Flags    Type St Inode Path
/// 0000000000000000: 00000002 00000000 00010000 0001 01 14066 @0000a
/// ```
fn has_socket_name(inodes: &[u64], sockname: &str) -> Liveness {
    let table = match fs::read_to_string("/proc/net/unix") {
        Ok(t) => t,
        Err(e) => {
            log::debug!("[BW] /proc/net/unix: {e}");
            return Liveness::Unknown;
        }
    };

    for line in table.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let inode = match cols.nth(6).and_then(|s| s.parse::<u64>().ok()) {
            Some(i) => i,
            None => return Liveness::Unknown,
        };
        // Path column is absent for unnamed sockets.
        let Some(path) = cols.next() else { continue };
        if path == sockname && inodes.contains(&inode) {
            return Liveness::Alive;
        }
    }

    Liveness::Dead
}

/// Clear every slot whose registered process no longer owns its socket.
///
/// Called with the ring lock held before slot scans on open and wake.
/// Returns the number of slots cleared.
pub(crate) fn prune(rec: &mut super::BwRecord) -> usize {
    let mut cleared = 0;
    for n in 0..super::BW_WAITMAX {
        let slot: BwSlot = rec.slots[n];
        if slot.pid == 0 {
            continue;
        }
        match has_pid_socket(slot.pid, &slot.name) {
            Liveness::Dead => {
                log::debug!("[BW] pruned stale slot {n} (pid {})", slot.pid);
                rec.slots[n].pid = 0;
                rec.seqno = rec.seqno.wrapping_add(1);
                cleared += 1;
            }
            // Occupied or inconclusive: leave alone.
            Liveness::Alive | Liveness::Unknown => {}
        }
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn name_of(s: &str) -> [u8; BW_NAMELEN] {
        let mut n = [0u8; BW_NAMELEN];
        n[..s.len()].copy_from_slice(s.as_bytes());
        n
    }

    #[test]
    fn dead_pid_is_dead() {
        // A freshly reaped child pid is guaranteed nonexistent (no reuse
        // this quickly in a test process).
        let child = Command::new("true").spawn().expect("spawn");
        let pid = child.id() as libc::pid_t;
        let mut child = child;
        child.wait().expect("wait");

        assert_eq!(has_pid_socket(pid, &name_of("@00000")), Liveness::Dead);
    }

    #[test]
    fn own_pid_without_socket_is_dead() {
        // We exist, but we do not own an abstract socket of this name.
        let me = std::process::id() as libc::pid_t;
        assert_eq!(has_pid_socket(me, &name_of("@zzzzz")), Liveness::Dead);
    }

    #[test]
    fn own_bound_socket_is_alive() {
        // Bind an autobound abstract socket and verify we are seen
        // holding it.
        let waiter = crate::bw::BwWaiter::open_standalone().expect("waiter");
        let me = std::process::id() as libc::pid_t;
        assert_eq!(has_pid_socket(me, waiter.name()), Liveness::Alive);
    }

    #[test]
    fn prune_clears_reaped_child() {
        let child = Command::new("true").spawn().expect("spawn");
        let pid = child.id() as libc::pid_t;
        let mut child = child;
        child.wait().expect("wait");

        // SAFETY: BwRecord is plain data; zeroed means all slots vacant.
        let mut rec: super::super::BwRecord = unsafe { std::mem::zeroed() };
        rec.slots[3].pid = pid;
        rec.slots[3].name = name_of("@00000");

        let seq_before = rec.seqno;
        assert_eq!(prune(&mut rec), 1);
        assert_eq!(rec.slots[3].pid, 0);
        assert_ne!(rec.seqno, seq_before);
    }
}
