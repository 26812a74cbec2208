// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! Farm-mode scenarios: broadcast fan-out, producer overwriting past a
//! reader, and missed-message accounting.

use shmring::{CreateOptions, Ring};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_ring(tag: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("shmring_{tag}_{ts}.ring"))
}

fn farm_opts() -> CreateOptions {
    CreateOptions {
        farm: true,
        ..Default::default()
    }
}

fn drain(r: &mut Ring) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = r.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        out.push(buf[..n].to_vec());
    }
    out
}

#[test]
fn farm_readers_observe_same_sequence() {
    let path = unique_ring("farm_fanout");
    Ring::create(&path, 256, &farm_opts()).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r1 = Ring::reader(&path).nonblock(true).open().expect("r1");
    let mut r2 = Ring::reader(&path).nonblock(true).open().expect("r2");

    for i in 0..10u8 {
        w.write(&[b'm', i]).expect("write");
    }

    let s1 = drain(&mut r1);
    let s2 = drain(&mut r2);
    assert_eq!(s1.len(), 10);
    // Reads do not consume: both farm readers see every message.
    assert_eq!(s1, s2);

    // A reader opened later starts at the eldest still present.
    let mut r3 = Ring::reader(&path).nonblock(true).open().expect("r3");
    assert_eq!(drain(&mut r3), s1);

    std::fs::remove_file(&path).ok();
}

#[test]
fn farm_overwrite_past_reader() {
    // 34-byte farm ring, large index. Eleven messages fill it to u=33;
    // a 4-byte write drops the eldest "AAA". A reader that had consumed
    // through "CCC" continues with "DDDD" unharmed; a reader opened after
    // the drop starts at "B".
    let path = unique_ring("farm_overwrite");
    let opts = CreateOptions {
        farm: true,
        max_msgs: Some(100),
        ..Default::default()
    };
    Ring::create(&path, 34, &opts).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut early = Ring::reader(&path).nonblock(true).open().expect("early");

    let msgs: [&[u8]; 11] = [
        b"AAA", b"B", b"CCC", b"DDDD", b"E", b"FFF", b"GGGG", b"HH", b"III", b"JJJJJ", b"KKKK",
    ];
    assert_eq!(msgs.iter().map(|m| m.len()).sum::<usize>(), 33);
    for m in msgs {
        w.write(m).expect("write");
    }

    // Consume the first three before the producer wraps.
    let mut buf = [0u8; 16];
    for expect in [&b"AAA"[..], b"B", b"CCC"] {
        let n = early.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], expect);
    }

    // One byte free; this write reclaims "AAA" (3 bytes) and wraps.
    w.write(b"LLLL").expect("write past eldest");

    // The early reader is ahead of the drop: nothing missed, continues
    // in sequence.
    let n = early.read(&mut buf).expect("read");
    assert_eq!(&buf[..n], b"DDDD");
    assert_eq!(early.farm_missed(false), 0);

    // A reader opened after the drop observes the sequence from "B".
    let mut late = Ring::reader(&path).nonblock(true).open().expect("late");
    let seen = drain(&mut late);
    assert_eq!(seen[0], b"B".to_vec());
    assert_eq!(seen[1], b"CCC".to_vec());
    assert_eq!(seen.last().expect("nonempty"), &b"LLLL".to_vec());
    assert_eq!(seen.len(), 11); // B..KKKK plus LLLL

    std::fs::remove_file(&path).ok();
}

#[test]
fn laggard_counts_missed_messages() {
    let path = unique_ring("farm_missed");
    let opts = CreateOptions {
        farm: true,
        max_msgs: Some(100),
        ..Default::default()
    };
    Ring::create(&path, 16, &opts).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    // 16 four-byte messages through a 16-byte ring: only the last four
    // survive; the reader missed the first twelve.
    for i in 0..16u8 {
        w.write(&[i; 4]).expect("write");
    }

    let seen = drain(&mut r);
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], vec![12u8; 4]);
    assert_eq!(seen[3], vec![15u8; 4]);

    assert_eq!(r.farm_missed(false), 12);
    // Reset semantics.
    assert_eq!(r.farm_missed(true), 12);
    assert_eq!(r.farm_missed(false), 0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn farm_drop_monotonicity() {
    // The eldest sequence only ever advances: a reader's missed count
    // never decreases and re-reads never happen.
    let path = unique_ring("farm_mono");
    Ring::create(&path, 64, &farm_opts()).expect("create");

    let mut w = Ring::writer(&path).open().expect("writer");
    let mut r = Ring::reader(&path).nonblock(true).open().expect("reader");

    fastrand::seed(99);
    let mut last_missed = 0usize;
    let mut total_seen = 0usize;
    let mut buf = [0u8; 32];

    for round in 0..200 {
        let burst = fastrand::usize(1..=6);
        for i in 0..burst {
            let len = fastrand::usize(1..=12);
            w.write(&vec![(round + i) as u8; len]).expect("write");
        }
        if fastrand::bool() {
            loop {
                let n = r.read(&mut buf).expect("read");
                if n == 0 {
                    break;
                }
                total_seen += 1;
            }
        }
        let missed = r.farm_missed(false);
        assert!(missed >= last_missed);
        last_missed = missed;
    }

    // Everything the producer published was either seen, missed, or is
    // still pending in the ring.
    loop {
        let n = r.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        total_seen += 1;
    }
    let st = r.stat(None).expect("stat");
    assert_eq!(st.msgs_written, total_seen + r.farm_missed(false));

    std::fs::remove_file(&path).ok();
}
