//! Shared test harness: a hand-rolled mock NBD peer (independent of the
//! crate's own wire codec, the way a real server process would be) plus a
//! `Scheduler`/`Upstream` pair that lets tests drive a [`nbd::Driver`]
//! synchronously instead of through a real event loop.
#![allow(dead_code)]
use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use nix::errno::Errno;

/// Initializes `env_logger` once per test binary so `log` output from the
/// driver shows up under `cargo test -- --nocapture`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const NBDMAGIC: u64 = 0x4e42444d41474943;
pub const OLD_MAGIC: u64 = 0x00420281861253;
pub const IHAVEOPT: u64 = 0x49484156454F5054;
pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;

/// Writes a full OLD-style preamble: `NBDMAGIC`, the OLD second magic,
/// export size, flags, and the 124-byte zero pad.
pub fn write_old_style(mut peer: impl Write, size: u64, flags: u32) {
    peer.write_u64::<BE>(NBDMAGIC).unwrap();
    peer.write_u64::<BE>(OLD_MAGIC).unwrap();
    peer.write_u64::<BE>(size).unwrap();
    peer.write_u32::<BE>(flags).unwrap();
    peer.write_all(&[0u8; 124]).unwrap();
    peer.flush().unwrap();
}

/// Runs the server side of a NEW-style handshake to completion: sends the
/// greeting and gflags, reads the client's cflags and `EXPORT_NAME` option,
/// and replies with `{size, xflags}` (no pad, since the client always
/// requests `NO_ZEROES`). Returns the export name the client asked for.
pub fn run_new_style(mut peer: impl Read + Write, export_size: u64, xflags: u16) -> String {
    peer.write_u64::<BE>(NBDMAGIC).unwrap();
    peer.write_u64::<BE>(IHAVEOPT).unwrap();
    peer.write_u16::<BE>(0x0003).unwrap(); // FIXED_NEWSTYLE | NO_ZEROES
    peer.flush().unwrap();

    let _cflags = peer.read_u32::<BE>().unwrap();

    let magic = peer.read_u64::<BE>().unwrap();
    assert_eq!(magic, IHAVEOPT);
    let opttype = peer.read_u32::<BE>().unwrap();
    assert_eq!(opttype, 1, "expected EXPORT_NAME option");
    let optlen = peer.read_u32::<BE>().unwrap();
    let mut name = vec![0u8; optlen as usize];
    peer.read_exact(&mut name).unwrap();

    peer.write_u64::<BE>(export_size).unwrap();
    peer.write_u16::<BE>(xflags).unwrap();
    peer.flush().unwrap();

    String::from_utf8(name).unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct WireRequest {
    pub typ: u16,
    pub handle: [u8; 8],
    pub offset: u64,
    pub length: u32,
}

/// Reads one 28-byte request header off the wire.
pub fn read_request(mut peer: impl Read) -> WireRequest {
    let magic = peer.read_u32::<BE>().unwrap();
    assert_eq!(magic, REQUEST_MAGIC);
    let _flags = peer.read_u16::<BE>().unwrap();
    let typ = peer.read_u16::<BE>().unwrap();
    let mut handle = [0u8; 8];
    peer.read_exact(&mut handle).unwrap();
    let offset = peer.read_u64::<BE>().unwrap();
    let length = peer.read_u32::<BE>().unwrap();
    WireRequest { typ, handle, offset, length }
}

/// Writes a 16-byte simple reply header, optionally followed by `body`
/// (for a successful `READ` reply).
pub fn write_reply(mut peer: impl Write, error: u32, handle: [u8; 8], body: &[u8]) {
    peer.write_u32::<BE>(SIMPLE_REPLY_MAGIC).unwrap();
    peer.write_u32::<BE>(error).unwrap();
    peer.write_all(&handle).unwrap();
    peer.write_all(body).unwrap();
    peer.flush().unwrap();
}

/// A `Scheduler` that does no real polling: it just hands out distinct ids
/// so tests can assert registration/unregistration counts, and records
/// which fds/modes are currently registered.
#[derive(Default)]
pub struct TestScheduler {
    next_id: u64,
    pub registrations: Vec<(u64, nbd::EventMode)>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, mode: nbd::EventMode) -> bool {
        self.registrations.iter().any(|(_, m)| *m == mode)
    }
}

impl nbd::Scheduler for TestScheduler {
    fn register_event(&mut self, mode: nbd::EventMode, _fd: std::os::fd::BorrowedFd) -> u64 {
        self.next_id += 1;
        self.registrations.push((self.next_id, mode));
        self.next_id
    }

    fn unregister_event(&mut self, id: u64) {
        self.registrations.retain(|(rid, _)| *rid != id);
    }
}

pub type Completion = (u64, Vec<u8>, Result<(), Errno>);

/// Records every completion (and secondary-mode forward) handed back by the
/// driver, for tests to inspect after driving it.
#[derive(Default, Clone)]
pub struct TestUpstream {
    pub completions: Rc<RefCell<Vec<Completion>>>,
    pub forwards: Rc<RefCell<Vec<(u64, u32, u64)>>>,
}

impl TestUpstream {
    pub fn new() -> Self {
        Self::default()
    }
}

impl nbd::Upstream for TestUpstream {
    fn td_complete_request(&mut self, tag: u64, buf: Vec<u8>, result: Result<(), Errno>) {
        self.completions.borrow_mut().push((tag, buf, result));
    }

    fn forward_read(&mut self, sector_start: u64, sector_count: u32, _buf: Vec<u8>, tag: u64) {
        self.forwards.borrow_mut().push((sector_start, sector_count, tag));
    }
}

/// Creates a connected pair and stashes one end under `id` so
/// `nbd::Driver::open(id, ...)` will pick it up; returns the other end for
/// the test to drive as the mock server.
pub fn stashed_pair(id: &str) -> UnixStream {
    let (driver_side, peer_side) = UnixStream::pair().unwrap();
    use std::os::fd::{FromRawFd, IntoRawFd};
    let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(driver_side.into_raw_fd()) };
    nbd::stash_fd(fd, id);
    peer_side
}
