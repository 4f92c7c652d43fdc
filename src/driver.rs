//! Driver facade: the narrow surface the upper block layer calls
//! (`open`/`close`/`queue_read`/`queue_write`/`get_parent_id`/`validate_parent`),
//! plus the configuration constants that govern every connection.
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::info;
use nix::errno::Errno;
use nix::sys::socket::{
    connect, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn, UnixAddr,
};

use crate::engine::{ConnState, Engine, Scheduler, Upstream};
use crate::fdstash;
use crate::handshake::{self, ExportGeometry};
use crate::proto::Cmd;
use crate::transport::{set_nonblocking, wait_send, Socket};

/// Hard bound on simultaneously in-flight requests per connection, re-exported
/// from [`crate::engine`] for callers that only need the driver facade.
pub use crate::engine::MAX_NBD_REQS;
/// Fd stash capacity, re-exported from [`crate::fdstash`].
pub use crate::fdstash::N_PASSED_FDS;

/// Fixed block size this driver operates in; offsets and lengths crossing
/// the wire are always a multiple of this.
pub const SECTOR_SIZE: u32 = 512;

/// Budget for the handshake's initial bounded wait and the close path's DISC
/// flush deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Export name this driver always negotiates (single fixed-export
/// convention).
pub const DEFAULT_EXPORT_NAME: &str = "default";

/// Local-socket name prefix the (out-of-scope) fd receiver listens on;
/// the full name is `FD_RECEIVER_PREFIX` followed by the receiver's pid.
pub const FD_RECEIVER_PREFIX: &str = "td-nbd-fdrecv-";

/// Deposits an already-connected socket into the process-wide fd stash under
/// `id`, exactly as the out-of-scope fd receiver would on accepting a
/// hand-off from a sibling process. A later `Driver::open(id, ...)` picks it
/// up through the third leg of the name-resolution order (§6). Exposed
/// publicly so an embedding daemon's own fd receiver — and test harnesses
/// standing in for one — can feed the stash without reimplementing it.
pub fn stash_fd(fd: OwnedFd, id: &str) {
    fdstash::global().lock().unwrap().stash(fd, id);
}

bitflags! {
    /// Open flags the upper layer may pass to [`Driver::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Reads are forwarded to another driver instead of being sent over
        /// the wire (see [`crate::engine::Upstream::forward_read`]).
        const SECONDARY = 0b01;
    }
}

/// A read or write request as handed down by the upper block layer.
#[derive(Debug)]
pub struct BlockRequest {
    pub sector_start: u64,
    pub sector_count: u32,
    pub buffer: Vec<u8>,
    pub tag: u64,
}

/// Errno this leaf driver returns from `get_parent_id`: it has none.
pub const NO_PARENT: Errno = Errno::ENOENT;

/// One open NBD connection and everything the driver facade needs to drive
/// it: the request engine, the underlying socket, and enough bookkeeping to
/// support `close`'s re-park-or-close decision.
pub struct Driver {
    engine: Engine,
    socket: Socket,
    flags: OpenFlags,
    /// `Some(name)` when this connection's socket came from (and should be
    /// returned to) the fd stash.
    stashed_as: Option<String>,
    geometry: ExportGeometry,
}

impl Driver {
    /// Resolves `name` per the resolution order (stat-is-socket →
    /// `HOST:PORT` → fd stash), connects, runs the handshake, and registers
    /// the reader callback. On any failure nothing is left registered and no
    /// fd is leaked into the stash.
    pub fn open(
        name: &str,
        flags: OpenFlags,
        sched: &mut dyn Scheduler,
    ) -> Result<Self> {
        let (fd, stashed_as) = connect_by_name(name)?;
        let mut socket = Socket::new(fd);

        let geometry = handshake::negotiate(&mut socket, DEFAULT_EXPORT_NAME)?;
        set_nonblocking(std::os::fd::AsFd::as_fd(&socket), true)?;

        let mut engine = Engine::new();
        engine.register_reader(sched, std::os::fd::AsFd::as_fd(&socket));

        info!(target: "nbd", "client connected to {name}");
        Ok(Driver {
            engine,
            socket,
            flags,
            stashed_as,
            geometry,
        })
    }

    pub fn geometry(&self) -> ExportGeometry {
        self.geometry
    }

    /// Queues a DISC and drains the writer until it's on the wire, the
    /// connection dies, or [`HANDSHAKE_TIMEOUT`] elapses. The socket stays
    /// non-blocking throughout: a peer applying backpressure fails the close
    /// with `ETIMEDOUT` rather than stalling it forever.
    pub fn close(mut self, sched: &mut dyn Scheduler, upstream: &mut dyn Upstream) -> Result<()> {
        if self.engine.state != ConnState::Dead {
            self.engine
                .queue_request(sched, std::os::fd::AsFd::as_fd(&self.socket), upstream, Cmd::DISC, 0, Vec::new(), 0)
                .map_err(|e| eyre!("queueing DISC: {e}"))?;

            let deadline = std::time::Instant::now() + HANDSHAKE_TIMEOUT;
            loop {
                self.engine.on_writable(sched, &self.socket, upstream);
                if self.engine.state == ConnState::Dead || self.engine.is_pending_empty() {
                    break;
                }
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if remaining.is_zero() {
                    self.engine.disable(sched, upstream, Errno::ETIMEDOUT);
                    break;
                }
                if wait_send(std::os::fd::AsFd::as_fd(&self.socket), remaining).is_err() {
                    self.engine.disable(sched, upstream, Errno::EIO);
                    break;
                }
            }
        }

        match self.stashed_as {
            Some(name) => {
                fdstash::global().lock().unwrap().park(self.socket.into_inner(), &name);
            }
            None => drop(self.socket),
        }
        info!(target: "nbd", "client disconnected");
        Ok(())
    }

    /// Enqueues a READ, or forwards it to the secondary driver if
    /// [`OpenFlags::SECONDARY`] is set.
    pub fn queue_read(
        &mut self,
        sched: &mut dyn Scheduler,
        upstream: &mut dyn Upstream,
        req: BlockRequest,
    ) -> Result<(), Errno> {
        if self.flags.contains(OpenFlags::SECONDARY) {
            upstream.forward_read(req.sector_start, req.sector_count, req.buffer, req.tag);
            return Ok(());
        }
        let offset = req.sector_start * SECTOR_SIZE as u64;
        self.engine.queue_request(
            sched,
            std::os::fd::AsFd::as_fd(&self.socket),
            upstream,
            Cmd::READ,
            offset,
            req.buffer,
            req.tag,
        )
    }

    /// Always enqueues a WRITE.
    pub fn queue_write(
        &mut self,
        sched: &mut dyn Scheduler,
        upstream: &mut dyn Upstream,
        req: BlockRequest,
    ) -> Result<(), Errno> {
        let offset = req.sector_start * SECTOR_SIZE as u64;
        self.engine.queue_request(
            sched,
            std::os::fd::AsFd::as_fd(&self.socket),
            upstream,
            Cmd::WRITE,
            offset,
            req.buffer,
            req.tag,
        )
    }

    /// Called by the embedding event loop when the scheduler reports the
    /// connection's fd is writable.
    pub fn on_writable(&mut self, sched: &mut dyn Scheduler, upstream: &mut dyn Upstream) {
        self.engine.on_writable(sched, &self.socket, upstream);
    }

    /// Called by the embedding event loop when the scheduler reports the
    /// connection's fd is readable.
    pub fn on_readable(&mut self, sched: &mut dyn Scheduler, upstream: &mut dyn Upstream) {
        self.engine.on_readable(sched, &self.socket, upstream);
    }

    /// This driver is a leaf: it has no parent image to report.
    pub fn get_parent_id(&self) -> Errno {
        NO_PARENT
    }

    /// This driver is a leaf: no parent to validate against.
    pub fn validate_parent(&self, _parent_name: &str) -> Errno {
        Errno::EINVAL
    }
}

/// Resolves `name` to a connected fd, per §6's resolution order: a
/// filesystem path to a `SOCK` inode, then `HOST:PORT`, then an fd-stash
/// lookup. Returns the fd plus, when it came from the stash, the name to
/// re-park it under on close.
fn connect_by_name(name: &str) -> Result<(OwnedFd, Option<String>)> {
    if let Ok(meta) = std::fs::metadata(name) {
        if std::os::unix::fs::FileTypeExt::is_socket(&meta.file_type()) {
            return Ok((connect_unix(name)?, None));
        }
    }

    if let Some((host, port)) = name.split_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if let Ok(addr) = Ipv4Addr::from_str(host) {
                return Ok((connect_tcp(addr, port)?, None));
            }
        }
    }

    let fd = fdstash::global()
        .lock()
        .unwrap()
        .retrieve(name)
        .ok_or_else(|| eyre!("no such export, socket, or stashed fd: {name}"))?;
    Ok((fd, Some(name.to_string())))
}

fn connect_unix(path: &str) -> Result<OwnedFd> {
    let addr = UnixAddr::new(Path::new(path))?;
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)?;
    connect(std::os::fd::AsRawFd::as_raw_fd(&fd), &addr)?;
    Ok(fd)
}

fn connect_tcp(addr: Ipv4Addr, port: u16) -> Result<OwnedFd> {
    let sockaddr = SockaddrIn::from(std::net::SocketAddrV4::new(addr, port));
    let fd = socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None)?;
    setsockopt(&fd, sockopt::TcpNoDelay, &true)?;
    connect(std::os::fd::AsRawFd::as_raw_fd(&fd), &sockaddr)?;
    Ok(fd)
}
