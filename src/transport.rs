//! Non-blocking socket transport: a thin wrapper over a stream socket file
//! descriptor plus cursor-tracked partial send/recv.
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

use log::warn;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recv, send, MsgFlags};

/// Outcome of a [`write_some`]/[`read_some`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// All requested bytes were transferred.
    Done,
    /// Some (possibly zero) bytes were transferred; more remain.
    NotDone,
}

/// A buffer-with-cursor pair: `so_far` bytes of `buf` have already crossed
/// the wire.
pub(crate) struct Cursor<'a> {
    buf: &'a mut [u8],
    so_far: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, so_far: 0 }
    }

    /// Builds a cursor already part-way through `buf`, for resuming progress
    /// tracked by a caller across non-contiguous calls (e.g. a slot's own
    /// cursor field).
    pub fn resume(buf: &'a mut [u8], so_far: usize) -> Self {
        Self { buf, so_far }
    }

    pub fn so_far(&self) -> usize {
        self.so_far
    }

    pub fn is_done(&self) -> bool {
        self.so_far >= self.buf.len()
    }
}

/// Attempts to send the remainder of `cur` on `fd` without blocking.
///
/// Returns `Ok(Progress::Done)` once `cur` is fully sent, `Ok(Progress::NotDone)`
/// on `EAGAIN`/`EWOULDBLOCK` or a partial send, and `Err` on a hard failure or
/// premature peer shutdown (a `send` returning `0` while bytes remain).
pub(crate) fn write_some(fd: BorrowedFd, cur: &mut Cursor) -> nix::Result<Progress> {
    if cur.is_done() {
        return Ok(Progress::Done);
    }
    loop {
        let remaining = &cur.buf[cur.so_far..];
        match send(fd.as_raw_fd(), remaining, MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => {
                warn!(target: "nbd", "peer closed during send");
                return Err(Errno::EIO);
            }
            Ok(n) => {
                cur.so_far += n;
                if cur.is_done() {
                    return Ok(Progress::Done);
                }
                // Partial write: loop once more in case the socket still has
                // room, but never block for it.
            }
            Err(Errno::EAGAIN) => return Ok(Progress::NotDone),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Symmetric with [`write_some`], using `recv`.
pub(crate) fn read_some(fd: BorrowedFd, cur: &mut Cursor) -> nix::Result<Progress> {
    if cur.is_done() {
        return Ok(Progress::Done);
    }
    loop {
        let remaining = &mut cur.buf[cur.so_far..];
        match recv(fd.as_raw_fd(), remaining, MsgFlags::empty()) {
            Ok(0) => {
                warn!(target: "nbd", "peer closed during recv");
                return Err(Errno::EIO);
            }
            Ok(n) => {
                cur.so_far += n;
                if cur.is_done() {
                    return Ok(Progress::Done);
                }
            }
            Err(Errno::EAGAIN) => return Ok(Progress::NotDone),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Polls `fd` for `flags` readiness, failing with `ETIMEDOUT` if `timeout`
/// elapses first without the fd becoming ready.
fn wait_poll(fd: BorrowedFd, flags: PollFlags, timeout: Duration) -> nix::Result<()> {
    let ms: u16 = timeout.as_millis().try_into().unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, flags)];
    let n = poll(&mut fds, PollTimeout::from(ms))?;
    if n == 0 {
        return Err(Errno::ETIMEDOUT);
    }
    Ok(())
}

/// Waits up to `timeout` for `fd` to become writable. Used by the close
/// path's bounded DISC flush, so a peer applying backpressure fails the
/// close instead of blocking it forever.
pub(crate) fn wait_send(fd: BorrowedFd, timeout: Duration) -> nix::Result<()> {
    wait_poll(fd, PollFlags::POLLOUT, timeout)
}

/// Toggles a socket's `O_NONBLOCK` flag.
pub(crate) fn set_nonblocking(fd: BorrowedFd, nonblocking: bool) -> nix::Result<()> {
    let cur = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let next = if nonblocking {
        cur | OFlag::O_NONBLOCK
    } else {
        cur & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(next))?;
    Ok(())
}

/// An owned connected stream socket (TCP, Unix, or handed off via the fd
/// stash); all sends/receives go through [`write_some`]/[`read_some`] (once
/// non-blocking) or [`TimedIo`] (during the blocking handshake).
#[derive(Debug)]
pub(crate) struct Socket(OwnedFd);

impl Socket {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn into_inner(self) -> OwnedFd {
        self.0
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A blocking, deadline-bounded view over a [`Socket`], used only during the
/// handshake. Every `Read`/`Write` call re-polls readiness against the same
/// shared `deadline` before issuing a single `recv`/`send`, so a peer that
/// stalls partway through the handshake — or applies backpressure on a
/// write — fails the whole handshake with `ETIMEDOUT` rather than hanging
/// `Driver::open` forever on any one step.
pub(crate) struct TimedIo<'a> {
    socket: &'a mut Socket,
    deadline: Instant,
}

impl<'a> TimedIo<'a> {
    pub fn new(socket: &'a mut Socket, deadline: Instant) -> Self {
        Self { socket, deadline }
    }

    fn remaining(&self) -> std::io::Result<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .ok_or(Errno::ETIMEDOUT)
            .map_err(std::io::Error::from)
    }
}

impl Read for TimedIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.remaining()?;
        wait_poll(self.socket.as_fd(), PollFlags::POLLIN, remaining)?;
        loop {
            match recv(self.socket.as_fd().as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(0) => return Err(Errno::EIO.into()),
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Write for TimedIo<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let remaining = self.remaining()?;
        wait_poll(self.socket.as_fd(), PollFlags::POLLOUT, remaining)?;
        loop {
            match send(self.socket.as_fd().as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
