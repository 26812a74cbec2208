// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! End-to-end ring scenarios: drop/reclaim, wrap-around, buffered
//! non-blocking writers, and conservation properties over randomized
//! traces.

use shmring::{CreateOptions, MsgSpan, Ring, RingError};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_ring(tag: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("shmring_{tag}_{ts}.ring"))
}

#[test]
fn drop_overwrite_then_read_survivors() {
    // Data size 7, plenty of index slots. "aa","bb","cc" fills to u=6;
    // "dd" reclaims "aa"; the reader sees "bb","cc","dd".
    let path = unique_ring("sc_drop");
    let opts = CreateOptions {
        drop_oldest: true,
        ..Default::default()
    };
    Ring::create(&path, 7, &opts).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    for msg in [b"aa", b"bb", b"cc", b"dd"] {
        assert_eq!(w.write(msg).expect("write"), 2);
    }

    let mut buf = [0u8; 8];
    let mut seen = Vec::new();
    loop {
        let n = r.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        seen.push(buf[..n].to_vec());
    }
    assert_eq!(seen, vec![b"bb".to_vec(), b"cc".to_vec(), b"dd".to_vec()]);

    let st = r.stat(None).expect("stat");
    assert_eq!(st.msgs_dropped, 1);
    assert_eq!(st.bytes_dropped, 2);
    assert_eq!(st.unread_bytes, 0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn wrapped_bodies_read_back_identical() {
    // Push varied message sizes through a small ring so bodies repeatedly
    // wrap past the data-area end; every byte must survive.
    let path = unique_ring("sc_wrap");
    Ring::create(&path, 23, &CreateOptions::default()).expect("create");

    let mut w = Ring::writer(&path).nonblock(true).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    fastrand::seed(7);
    let mut sent: Vec<Vec<u8>> = Vec::new();
    let mut received: Vec<Vec<u8>> = Vec::new();
    let mut buf = [0u8; 32];

    for round in 0..400 {
        let len = fastrand::usize(1..=15);
        let msg: Vec<u8> = (0..len).map(|i| (round * 31 + i) as u8).collect();
        if w.write(&msg).expect("write") == msg.len() {
            sent.push(msg);
        }
        // Drain opportunistically so the ring keeps making progress.
        if fastrand::bool() {
            loop {
                let n = r.read(&mut buf).expect("read");
                if n == 0 {
                    break;
                }
                received.push(buf[..n].to_vec());
            }
        }
    }
    loop {
        let n = r.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        received.push(buf[..n].to_vec());
    }

    assert_eq!(sent, received);
    std::fs::remove_file(&path).ok();
}

#[test]
fn byte_and_message_conservation_nondrop() {
    // Across any trace on a non-drop ring:
    // bytes_written == bytes_read + bytes_in_ring (nothing ever drops).
    let path = unique_ring("sc_conserve");
    Ring::create(&path, 257, &CreateOptions::default()).expect("create");

    let mut w = Ring::writer(&path).nonblock(true).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    fastrand::seed(42);
    let (mut bytes_written, mut msgs_written) = (0usize, 0usize);
    let (mut bytes_read, mut msgs_read) = (0usize, 0usize);
    let mut buf = [0u8; 64];

    for _ in 0..1000 {
        if fastrand::u8(..) < 160 {
            let len = fastrand::usize(1..=40);
            let msg = vec![fastrand::u8(..); len];
            let n = w.write(&msg).expect("write");
            if n > 0 {
                assert_eq!(n, len, "writes are all-or-nothing");
                bytes_written += n;
                msgs_written += 1;
            }
        } else {
            let n = r.read(&mut buf).expect("read");
            if n > 0 {
                bytes_read += n;
                msgs_read += 1;
            }
        }
    }

    let st = r.stat(None).expect("stat");
    assert_eq!(st.bytes_written, bytes_written);
    assert_eq!(st.bytes_read, bytes_read);
    assert_eq!(st.msgs_dropped, 0);
    assert_eq!(bytes_written, bytes_read + st.unread_bytes);
    assert_eq!(msgs_written, msgs_read + st.unread_msgs);

    std::fs::remove_file(&path).ok();
}

#[test]
fn byte_and_message_conservation_drop_ring() {
    // Drop ring: bytes_written == bytes_read + bytes_dropped + in_ring.
    let path = unique_ring("sc_conserve_drop");
    let opts = CreateOptions {
        drop_oldest: true,
        ..Default::default()
    };
    Ring::create(&path, 101, &opts).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    fastrand::seed(1234);
    let mut buf = [0u8; 64];
    let mut dropped_floor = 0usize;

    for _ in 0..1000 {
        if fastrand::u8(..) < 200 {
            let len = fastrand::usize(1..=30);
            let msg = vec![b'x'; len];
            assert_eq!(w.write(&msg).expect("write"), len, "drop mode never stalls");
        } else {
            loop {
                if r.read(&mut buf).expect("read") == 0 {
                    break;
                }
            }
        }
        let st = r.stat(None).expect("stat");
        assert_eq!(
            st.bytes_written,
            st.bytes_read + st.bytes_dropped + st.unread_bytes
        );
        assert_eq!(
            st.msgs_written,
            st.msgs_read + st.msgs_dropped + st.unread_msgs
        );
        // Drop counters only ever grow.
        assert!(st.msgs_dropped >= dropped_floor);
        dropped_floor = st.msgs_dropped;
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn nonblocking_buffered_writer_overflow() {
    // Ring of 5 bytes, buffered non-blocking writer. "hello" lands in the
    // cache; "world" forces "hello" into the ring and takes its place;
    // "there" fails with 0 because neither cache nor ring has room.
    let path = unique_ring("sc_buffered");
    Ring::create(&path, 5, &CreateOptions::default()).expect("create");

    let mut w = Ring::writer(&path)
        .nonblock(true)
        .buffered(true)
        .open()
        .expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    assert_eq!(w.write(b"hello").expect("write hello"), 5);
    assert_eq!(w.write(b"world").expect("write world"), 5);
    assert_eq!(w.write(b"there").expect("write there"), 0);

    // Explicit flush cannot help while the ring is still full.
    assert_eq!(w.flush(false).expect("flush full"), 0);

    let mut buf = [0u8; 8];
    assert_eq!(r.read(&mut buf).expect("read"), 5);
    assert_eq!(&buf[..5], b"hello");

    // Now the cached "world" flushes.
    assert_eq!(w.flush(false).expect("flush"), 5);
    assert_eq!(r.read(&mut buf).expect("read"), 5);
    assert_eq!(&buf[..5], b"world");

    let st = w.stat(None).expect("stat");
    assert_eq!(st.cache_bytes, 0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn readv_batch_stops_at_buffer_edge() {
    let path = unique_ring("sc_batch");
    Ring::create(&path, 256, &CreateOptions::default()).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    for msg in [&b"0123"[..], b"4567", b"89ab", b"cdef"] {
        w.write(msg).expect("write");
    }

    // Ten bytes of buffer holds exactly two 4-byte messages.
    let mut buf = [0u8; 10];
    let mut spans = [MsgSpan::default(); 8];
    let batch = r.readv(&mut buf, &mut spans).expect("readv");
    assert_eq!(batch.msgs, 2);
    assert_eq!(batch.bytes, 8);

    // And the remaining two stay readable.
    let batch = r.readv(&mut buf, &mut spans).expect("readv rest");
    assert_eq!(batch.msgs, 2);
    assert_eq!(&buf[spans[0].off..spans[0].off + spans[0].len], b"89ab");
    assert_eq!(&buf[spans[1].off..spans[1].off + spans[1].len], b"cdef");

    std::fs::remove_file(&path).ok();
}

#[test]
fn msg_too_big_leaves_ring_intact() {
    let path = unique_ring("sc_toobig");
    Ring::create(&path, 64, &CreateOptions::default()).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    w.write(b"twelve bytes").expect("write");

    let mut tiny = [0u8; 4];
    assert!(matches!(
        r.read(&mut tiny),
        Err(RingError::MsgTooBig { need: 12, have: 4 })
    ));
    let st = r.stat(None).expect("stat");
    assert_eq!(st.unread_msgs, 1);
    assert_eq!(st.unread_bytes, 12);

    std::fs::remove_file(&path).ok();
}
