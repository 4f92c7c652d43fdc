mod support;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;

use nbd::{BlockRequest, Driver, OpenFlags, MAX_NBD_REQS};
use nix::errno::Errno;
use rand::RngCore;
use support::{
    init_logging, read_request, stashed_pair, write_old_style, write_reply, TestScheduler,
    TestUpstream, CMD_READ,
};

/// Brings up a `Driver` against an in-process peer using the OLD-style
/// handshake (cheapest to drive single-threaded: the whole preamble can be
/// written before `open` is even called).
fn open_driver(id: &str) -> (Driver, UnixStream) {
    let mut peer = stashed_pair(id);
    write_old_style(&mut peer, 0x1000_0000, 0);
    peer.flush().unwrap();

    let mut sched = TestScheduler::new();
    let driver = Driver::open(id, OpenFlags::empty(), &mut sched).unwrap();
    (driver, peer)
}

#[test]
fn random_payload_read_round_trip() {
    init_logging();
    let (mut driver, mut peer) = open_driver("e2e-random-payload");
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    let mut filler = vec![0u8; 512];
    rand::thread_rng().fill_bytes(&mut filler);

    driver
        .queue_read(
            &mut sched,
            &mut upstream,
            BlockRequest { sector_start: 4, sector_count: 1, buffer: vec![0; 512], tag: 42 },
        )
        .unwrap();
    driver.on_writable(&mut sched, &mut upstream);

    let req = read_request(&mut peer);
    assert_eq!(req.offset, 4 * 512);
    write_reply(&mut peer, 0, req.handle, &filler);
    driver.on_readable(&mut sched, &mut upstream);

    let completions = upstream.completions.borrow();
    assert_eq!(completions.len(), 1);
    let (tag, buf, result) = &completions[0];
    assert_eq!(*tag, 42);
    assert!(result.is_ok());
    assert_eq!(buf, &filler);
}

#[test]
fn single_read_round_trip() {
    let (mut driver, mut peer) = open_driver("e2e-single-read");
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    driver
        .queue_read(
            &mut sched,
            &mut upstream,
            BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: 7 },
        )
        .unwrap();
    driver.on_writable(&mut sched, &mut upstream);

    let req = read_request(&mut peer);
    assert_eq!(req.typ, CMD_READ);
    assert_eq!(req.offset, 0);
    assert_eq!(req.length, 512);
    assert_eq!(&req.handle, b"td00000\0");

    write_reply(&mut peer, 0, req.handle, &[0xAB; 512]);
    driver.on_readable(&mut sched, &mut upstream);

    let completions = upstream.completions.borrow();
    assert_eq!(completions.len(), 1);
    let (tag, buf, result) = &completions[0];
    assert_eq!(*tag, 7);
    assert!(result.is_ok());
    assert!(buf.iter().all(|&b| b == 0xAB));
}

#[test]
fn out_of_order_replies_both_complete() {
    let (mut driver, mut peer) = open_driver("e2e-out-of-order");
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: 1 })
        .unwrap();
    driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 1, sector_count: 1, buffer: vec![0; 512], tag: 2 })
        .unwrap();
    driver.on_writable(&mut sched, &mut upstream);

    let r1 = read_request(&mut peer);
    let r2 = read_request(&mut peer);
    assert_eq!(&r1.handle, b"td00000\0");
    assert_eq!(&r2.handle, b"td00001\0");

    // Peer replies to r2 first.
    write_reply(&mut peer, 0, r2.handle, &[0x11; 512]);
    driver.on_readable(&mut sched, &mut upstream);
    write_reply(&mut peer, 0, r1.handle, &[0x22; 512]);
    driver.on_readable(&mut sched, &mut upstream);

    let completions = upstream.completions.borrow();
    assert_eq!(completions.len(), 2);
    assert!(completions.iter().all(|(_, _, r)| r.is_ok()));
    let tags: Vec<u64> = completions.iter().map(|(t, _, _)| *t).collect();
    assert!(tags.contains(&1));
    assert!(tags.contains(&2));
}

#[test]
fn peer_closes_mid_reply_disables_connection() {
    let (mut driver, mut peer) = open_driver("e2e-mid-reply-close");
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: 5 })
        .unwrap();
    driver.on_writable(&mut sched, &mut upstream);
    let _req = read_request(&mut peer);

    // Eight bytes of the 16-byte reply header, then close.
    peer.write_all(&[0x67, 0x44, 0x66, 0x98, 0, 0, 0, 0]).unwrap();
    peer.flush().unwrap();
    drop(peer);

    driver.on_readable(&mut sched, &mut upstream);
    // Non-blocking recv may return NotDone once before the peer's FIN is
    // observed; drive it again to be sure disable has happened.
    driver.on_readable(&mut sched, &mut upstream);

    let completions = upstream.completions.borrow();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0], (5, Vec::new(), Err(Errno::EIO)));

    // Further enqueue completes immediately with ETIMEDOUT.
    drop(completions);
    driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: 6 })
        .unwrap();
    let completions = upstream.completions.borrow();
    assert_eq!(completions.last(), Some(&(6, vec![0; 512], Err(Errno::ETIMEDOUT))));
}

#[test]
fn close_sends_disc_and_fails_outstanding_requests() {
    let (mut driver, mut peer) = open_driver("e2e-disc-on-close");
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: 1 })
        .unwrap();
    driver.on_writable(&mut sched, &mut upstream);
    let _req = read_request(&mut peer);

    // Drain the mock peer's receive buffer on a helper thread so close's
    // bounded, non-blocking DISC flush has somewhere to put the bytes.
    let drain = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let _ = peer.read(&mut buf);
    });

    driver.close(&mut sched, &mut upstream).unwrap();
    drain.join().unwrap();

    let completions = upstream.completions.borrow();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0], (1, vec![0; 512], Err(Errno::EIO)));
}

#[test]
fn enqueue_exactly_capacity_then_busy_via_driver() {
    let (mut driver, _peer) = open_driver("e2e-capacity");
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    for i in 0..MAX_NBD_REQS {
        driver
            .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: i as u64 })
            .unwrap();
    }
    let err = driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 0, sector_count: 1, buffer: vec![0; 512], tag: 999 })
        .unwrap_err();
    assert_eq!(err, Errno::EBUSY);
}

#[test]
fn secondary_flag_forwards_reads_instead_of_queuing() {
    let (mut driver, _peer) = {
        let mut peer = stashed_pair("e2e-secondary");
        write_old_style(&mut peer, 0x1000_0000, 0);
        peer.flush().unwrap();
        let mut sched = TestScheduler::new();
        let driver = Driver::open("e2e-secondary", OpenFlags::SECONDARY, &mut sched).unwrap();
        (driver, peer)
    };
    let mut sched = TestScheduler::new();
    let mut upstream = TestUpstream::new();

    driver
        .queue_read(&mut sched, &mut upstream, BlockRequest { sector_start: 3, sector_count: 2, buffer: vec![0; 1024], tag: 11 })
        .unwrap();

    assert!(upstream.completions.borrow().is_empty());
    let forwards = upstream.forwards.borrow();
    assert_eq!(forwards.as_slice(), &[(3, 2, 11)]);
}
