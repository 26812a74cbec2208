// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmring developers

//! shmringctl - create, inspect and exercise ring files.
//!
//! The read side doubles as a worked example of the blocking API: a pipe
//! written from the SIGINT handler is registered as an ancillary
//! descriptor, so a blocked read unwinds cleanly on Ctrl-C.

use clap::{Parser, Subcommand};
use shmring::{CreateOptions, Ring, RingError};
use std::io::BufRead;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::SystemTime;

/// Manage shmring ring files
#[derive(Parser, Debug)]
#[command(name = "shmringctl", version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create a ring file
    Create {
        /// Data-area size, with optional k/m/g/t suffix (e.g. 1m)
        #[arg(short, long)]
        size: String,

        /// Drop unread eldest messages when full instead of blocking
        #[arg(long = "drop")]
        drop_oldest: bool,

        /// Broadcast to multiple readers (implies --drop)
        #[arg(long)]
        farm: bool,

        /// msync the mapping after every operation
        #[arg(long)]
        sync: bool,

        /// mlock the mapping at open
        #[arg(long)]
        mlock: bool,

        /// Leave an already-existing ring untouched
        #[arg(long)]
        keep_existing: bool,

        /// Message-index capacity (default: 100 + size/100)
        #[arg(long)]
        max_msgs: Option<usize>,

        /// Ring file path
        ring: PathBuf,
    },

    /// Show ring statistics
    Status {
        /// Also reset the stats period
        #[arg(long)]
        reset: bool,

        /// Ring file path
        ring: PathBuf,
    },

    /// Write messages (arguments, or lines from stdin)
    Write {
        /// Ring file path
        ring: PathBuf,

        /// Messages; reads stdin lines when empty
        msgs: Vec<String>,
    },

    /// Read messages to stdout
    Read {
        /// Keep reading, blocking for new messages (Ctrl-C to stop)
        #[arg(short, long)]
        block: bool,

        /// Hex-dump message bodies
        #[arg(short = 'x', long)]
        hex: bool,

        /// Ring file path
        ring: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("shmringctl: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cmd: Cmd) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        Cmd::Create {
            size,
            drop_oldest,
            farm,
            sync,
            mlock,
            keep_existing,
            max_msgs,
            ring,
        } => {
            let data_size =
                parse_size(&size).ok_or(RingError::InvalidInput("unparseable --size value"))?;
            let opts = CreateOptions {
                drop_oldest,
                farm,
                sync,
                mlock,
                keep_existing,
                app_data: None,
                max_msgs,
            };
            Ring::create(&ring, data_size, &opts)?;
            println!("created {} ({data_size} data bytes)", ring.display());
            Ok(())
        }

        Cmd::Status { reset, ring } => {
            // Opening read-only would claim a waiter slot; a writer handle
            // keeps status cheap.
            let mut h = Ring::writer(&ring).nonblock(true).open()?;
            let reset_to = reset.then(SystemTime::now);
            let st = h.stat(reset_to)?;

            let mut mode = Vec::new();
            if st.drop_mode {
                mode.push("drop");
            }
            if st.farm {
                mode.push("farm");
            }
            if st.sync {
                mode.push("sync");
            }
            if st.mlock {
                mode.push("mlock");
            }
            if mode.is_empty() {
                mode.push("queue");
            }

            println!("ring          {}", ring.display());
            println!("mode          {}", mode.join("+"));
            println!("data bytes    {}", st.ring_size);
            println!("index slots   {}", st.max_msgs);
            println!("unread        {} bytes in {} messages", st.unread_bytes, st.unread_msgs);
            if st.app_len > 0 {
                println!("app data      {} bytes", st.app_len);
            }
            println!("period start  {:?}", st.start);
            println!(
                "written       {} bytes / {} messages",
                st.bytes_written, st.msgs_written
            );
            println!(
                "read          {} bytes / {} messages",
                st.bytes_read, st.msgs_read
            );
            if st.drop_mode {
                println!(
                    "dropped       {} bytes / {} messages",
                    st.bytes_dropped, st.msgs_dropped
                );
            }
            Ok(())
        }

        Cmd::Write { ring, msgs } => {
            let mut w = Ring::writer(&ring).open()?;
            let mut count = 0usize;
            if msgs.is_empty() {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    w.write(line.as_bytes())?;
                    count += 1;
                }
            } else {
                for m in &msgs {
                    w.write(m.as_bytes())?;
                    count += 1;
                }
            }
            println!("wrote {count} messages");
            Ok(())
        }

        Cmd::Read { block, hex, ring } => {
            if block {
                read_blocking(&ring, hex)?;
            } else {
                read_drain(&ring, hex)?;
            }
            Ok(())
        }
    }
}

/// Drain whatever is currently in the ring and return.
fn read_drain(ring: &Path, hex: bool) -> Result<(), RingError> {
    let mut r = Ring::reader(ring).nonblock(true).open()?;
    let mut buf = vec![0u8; 1 << 20];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => print_msg(&buf[..n], hex),
            Err(RingError::MsgTooBig { need, .. }) => {
                eprintln!("shmringctl: growing buffer for {need}-byte message");
                buf.resize(need, 0);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Block for messages until Ctrl-C, which fires the watched pipe.
fn read_blocking(ring: &Path, hex: bool) -> Result<(), RingError> {
    let mut r = Ring::reader(ring).open()?;
    let sig_fd = install_sigint_pipe();
    if sig_fd >= 0 {
        r.watch_fd(sig_fd)?;
    }

    let mut buf = vec![0u8; 1 << 20];
    loop {
        match r.read(&mut buf) {
            Ok(n) => print_msg(&buf[..n], hex),
            Err(RingError::WatchedFdReady) => {
                eprintln!("shmringctl: interrupted");
                return Ok(());
            }
            Err(RingError::MsgTooBig { need, .. }) => {
                eprintln!("shmringctl: growing buffer for {need}-byte message");
                buf.resize(need, 0);
            }
            Err(e) => return Err(e),
        }
    }
}

fn print_msg(body: &[u8], hex: bool) {
    if hex {
        hexdump(body);
    } else {
        let text = String::from_utf8_lossy(body);
        println!("{text}");
    }
}

fn hexdump(body: &[u8]) {
    for (i, chunk) in body.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<48}  {ascii}", i * 16, bytes.join(" "));
    }
}

/// Parse `123`, `64k`, `16m`, `1g`, `1t`.
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (num, mul) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1usize << 10),
        'm' | 'M' => (&s[..s.len() - 1], 1 << 20),
        'g' | 'G' => (&s[..s.len() - 1], 1 << 30),
        't' | 'T' => (&s[..s.len() - 1], 1 << 40),
        _ => (s, 1),
    };
    let n: usize = num.parse().ok()?;
    n.checked_mul(mul)
}

static SIGINT_PIPE_W: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

extern "C" fn on_sigint(_sig: libc::c_int) {
    let fd = SIGINT_PIPE_W.load(std::sync::atomic::Ordering::Relaxed);
    if fd >= 0 {
        let byte = b'!';
        // SAFETY: write(2) is async-signal-safe; fd is the pipe write end.
        unsafe {
            libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
        }
    }
}

/// Self-pipe for SIGINT: returns the read end for watch_fd.
fn install_sigint_pipe() -> RawFd {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: pipe2 fills fds on success; failure leaves them untouched
    // and the handler simply never fires a byte.
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
            return -1;
        }
    }
    SIGINT_PIPE_W.store(fds[1], std::sync::atomic::Ordering::Relaxed);

    // SAFETY: installing a handler that only calls async-signal-safe
    // write(2) on the self-pipe.
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
    fds[0]
}
