//! The request engine: a bounded pool of request slots threaded through
//! three intrusive lists (free / pending-to-send / sent-awaiting-reply),
//! driven by a writer callback and a reader callback that the embedding
//! connection registers with the external scheduler.
//!
//! Slots live in a fixed-size array and list membership is expressed with
//! `prev`/`next` indices rather than pointers — a slot is a member of
//! exactly one list at a time, so a single linkage pair can be reused across
//! all three lists.
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use nix::errno::Errno;

use crate::proto::{Cmd, ErrorType, ReplyHeader, RequestHeader, HANDLE_LEN, REPLY_HEADER_LEN};
use crate::transport::{read_some, write_some, Cursor, Progress, Socket};

/// Hard bound on simultaneously in-flight requests per connection.
pub const MAX_NBD_REQS: usize = 64;

/// Opaque token the embedding scheduler hands back from `register_event`;
/// `None` means "not registered", matching the source's `-1` sentinel.
pub type EventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    Read,
    Write,
}

/// The event-loop contract this engine needs from its environment.
pub trait Scheduler {
    fn register_event(&mut self, mode: EventMode, fd: BorrowedFd) -> EventId;
    fn unregister_event(&mut self, id: EventId);
}

/// The upper block layer's completion sink.
pub trait Upstream {
    /// Delivers the final status of a previously queued request. `buf` is
    /// the same buffer passed to `queue_request` (filled, for a successful
    /// read; echoed back unchanged otherwise) handed back for the caller to
    /// reclaim or recycle.
    fn td_complete_request(&mut self, tag: u64, buf: Vec<u8>, result: Result<(), Errno>);

    /// Secondary-mode hook: a read arriving while the driver's "secondary"
    /// open flag is set is handed here instead of being placed on the wire,
    /// so a different driver in the chain can service it. The engine never
    /// calls this itself — only the driver facade's `queue_read` does.
    fn forward_read(&mut self, sector_start: u64, sector_count: u32, buf: Vec<u8>, tag: u64);
}

/// Tri-state connection lifecycle, matching the source's `{0, 2, 3}` (value 1
/// is unused there; this is its corrected enum per the design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Live,
    DiscSent,
    Dead,
}

static HANDLE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generates the next 8-byte request handle: ASCII `"td"` followed by five
/// lowercase hex digits and a trailing NUL, drawn from a 20-bit
/// process-wide counter. Uniqueness across simultaneously in-flight
/// requests is expected, not enforced (see the handle-uniqueness design
/// note carried over from the source).
fn next_handle() -> [u8; HANDLE_LEN] {
    let n = HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
    let s = format!("td{n:05x}");
    let mut handle = [0u8; HANDLE_LEN];
    handle[..s.len()].copy_from_slice(s.as_bytes());
    handle
}

struct Slot {
    header: [u8; crate::proto::REQUEST_HEADER_LEN],
    header_cursor: usize,
    body: Vec<u8>,
    body_cursor: usize,
    typ: Cmd,
    handle: [u8; HANDLE_LEN],
    tag: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            header: [0; crate::proto::REQUEST_HEADER_LEN],
            header_cursor: 0,
            body: Vec::new(),
            body_cursor: 0,
            typ: Cmd::READ,
            handle: [0; HANDLE_LEN],
            tag: 0,
            prev: None,
            next: None,
        }
    }

    fn header_done(&self) -> bool {
        self.header_cursor >= self.header.len()
    }

    fn body_done(&self) -> bool {
        self.body_cursor >= self.body.len()
    }
}

/// A doubly-linked list of slot indices. Does not own the slots; every
/// operation is handed the backing array explicitly.
#[derive(Default)]
struct SlotList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl SlotList {
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push_back(&mut self, slots: &mut [Slot], idx: usize) {
        slots[idx].prev = self.tail;
        slots[idx].next = None;
        match self.tail {
            Some(t) => slots[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    fn pop_front(&mut self, slots: &mut [Slot]) -> Option<usize> {
        let idx = self.head?;
        self.remove(slots, idx);
        Some(idx)
    }

    /// Detaches `idx` from this list, wherever it sits.
    fn remove(&mut self, slots: &mut [Slot], idx: usize) {
        let prev = slots[idx].prev;
        let next = slots[idx].next;
        match prev {
            Some(p) => slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => slots[n].prev = prev,
            None => self.tail = prev,
        }
        slots[idx].prev = None;
        slots[idx].next = None;
        self.len -= 1;
    }

    fn iter_indices(&self, slots: &[Slot]) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(i) = cur {
            out.push(i);
            cur = slots[i].next;
        }
        out
    }
}

/// Per-connection engine state: the slot arena, its three lists, and the
/// staging area for the reply currently being read.
pub(crate) struct Engine {
    slots: Vec<Slot>,
    free: SlotList,
    pending: SlotList,
    sent: SlotList,
    nr_free: usize,
    writer_event: Option<EventId>,
    reader_event: Option<EventId>,
    current_reply: [u8; REPLY_HEADER_LEN],
    current_reply_cursor: usize,
    current_reply_req: Option<usize>,
    pub(crate) state: ConnState,
}

impl Engine {
    pub fn new() -> Self {
        let mut slots: Vec<Slot> = (0..MAX_NBD_REQS).map(|_| Slot::empty()).collect();
        let mut free = SlotList::default();
        for i in 0..MAX_NBD_REQS {
            free.push_back(&mut slots, i);
        }
        Engine {
            slots,
            free,
            pending: SlotList::default(),
            sent: SlotList::default(),
            nr_free: MAX_NBD_REQS,
            writer_event: None,
            reader_event: None,
            current_reply: [0; REPLY_HEADER_LEN],
            current_reply_cursor: 0,
            current_reply_req: None,
            state: ConnState::Live,
        }
    }

    pub fn nr_free(&self) -> usize {
        self.nr_free
    }

    pub fn is_pending_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn writer_registered(&self) -> bool {
        self.writer_event.is_some()
    }

    /// Invariant check used by tests: every slot appears in exactly one
    /// list and the counts sum to the pool capacity.
    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.nr_free, self.free.len);
        assert_eq!(self.nr_free + self.pending.len + self.sent.len, MAX_NBD_REQS);
        let mut seen = vec![0u8; self.slots.len()];
        for idx in self
            .free
            .iter_indices(&self.slots)
            .into_iter()
            .chain(self.pending.iter_indices(&self.slots))
            .chain(self.sent.iter_indices(&self.slots))
        {
            seen[idx] += 1;
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    /// Enqueues a request. Returns `Err(Errno::EBUSY)` if the pool is
    /// exhausted. If the connection is already dead, completes `upstream`
    /// immediately with `ETIMEDOUT` and returns `Ok(())` — from the caller's
    /// perspective nothing was rejected, it simply finished instantly.
    pub fn queue_request(
        &mut self,
        sched: &mut dyn Scheduler,
        fd: BorrowedFd,
        upstream: &mut dyn Upstream,
        typ: Cmd,
        offset: u64,
        body: Vec<u8>,
        tag: u64,
    ) -> Result<(), Errno> {
        if self.state == ConnState::Dead {
            upstream.td_complete_request(tag, body, Err(Errno::ETIMEDOUT));
            return Ok(());
        }
        if self.nr_free == 0 {
            return Err(Errno::EBUSY);
        }

        let idx = self.free.pop_front(&mut self.slots).expect("nr_free > 0");
        self.nr_free -= 1;

        let handle = next_handle();
        let length = body.len() as u32;
        let header = RequestHeader::new(typ, handle, offset, length).encode();

        let slot = &mut self.slots[idx];
        slot.header = header;
        slot.header_cursor = 0;
        slot.body = body;
        slot.body_cursor = 0;
        slot.typ = typ;
        slot.handle = handle;
        slot.tag = tag;

        self.pending.push_back(&mut self.slots, idx);
        self.ensure_writer_registered(sched, fd);
        Ok(())
    }

    fn ensure_writer_registered(&mut self, sched: &mut dyn Scheduler, fd: BorrowedFd) {
        if self.writer_event.is_none() {
            self.writer_event = Some(sched.register_event(EventMode::Write, fd));
        }
    }

    /// Drains as much of `pending` onto the wire as the socket will accept
    /// without blocking. Stops at the first short write, leaving the
    /// partially-sent slot at the head of `pending` for the next call.
    pub fn on_writable(
        &mut self,
        sched: &mut dyn Scheduler,
        socket: &Socket,
        upstream: &mut dyn Upstream,
    ) {
        let fd = socket.as_fd();
        loop {
            let Some(idx) = self.pending.head else { break };

            if !self.slots[idx].header_done() {
                let header_len = self.slots[idx].header.len();
                let progress = write_from(fd, &mut self.slots[idx].header, header_len, &mut self.slots[idx].header_cursor);
                match progress {
                    Ok(Progress::Done) => {}
                    Ok(Progress::NotDone) => return,
                    Err(e) => {
                        self.disable(sched, upstream, e);
                        return;
                    }
                }
            }

            if self.slots[idx].typ == Cmd::WRITE && !self.slots[idx].body_done() {
                let body_len = self.slots[idx].body.len();
                let progress = write_from(fd, &mut self.slots[idx].body, body_len, &mut self.slots[idx].body_cursor);
                match progress {
                    Ok(Progress::Done) => {}
                    Ok(Progress::NotDone) => return,
                    Err(e) => {
                        self.disable(sched, upstream, e);
                        return;
                    }
                }
            }

            // Fully sent.
            self.pending.remove(&mut self.slots, idx);
            if self.slots[idx].typ == Cmd::DISC {
                self.free.push_back(&mut self.slots, idx);
                self.nr_free += 1;
                self.state = ConnState::DiscSent;
            } else {
                self.sent.push_back(&mut self.slots, idx);
            }
        }

        if let Some(id) = self.writer_event.take() {
            sched.unregister_event(id);
        }
        if self.state == ConnState::DiscSent {
            self.disable(sched, upstream, Errno::EIO);
        }
    }

    /// Registers the reader callback; called once at `open` and kept
    /// registered for the connection's whole live period.
    pub fn register_reader(&mut self, sched: &mut dyn Scheduler, fd: BorrowedFd) {
        self.reader_event = Some(sched.register_event(EventMode::Read, fd));
    }

    /// Consumes one reply header (and, for reads, its trailing body) off the
    /// wire. May return having made partial progress; the partial state
    /// lives in `current_reply`/`current_reply_cursor` for the next call.
    pub fn on_readable(
        &mut self,
        sched: &mut dyn Scheduler,
        socket: &Socket,
        upstream: &mut dyn Upstream,
    ) {
        let fd = socket.as_fd();

        if self.current_reply_req.is_none() {
            let progress = read_into(
                fd,
                &mut self.current_reply,
                REPLY_HEADER_LEN,
                &mut self.current_reply_cursor,
            );
            match progress {
                Ok(Progress::NotDone) => return,
                Err(e) => {
                    self.disable(sched, upstream, e);
                    return;
                }
                Ok(Progress::Done) => {}
            }

            let reply = match ReplyHeader::decode(&self.current_reply) {
                Ok(r) => r,
                Err(_) => {
                    self.disable(sched, upstream, Errno::EIO);
                    return;
                }
            };
            if reply.error != 0 {
                match ErrorType::try_from(reply.error) {
                    Ok(err) => warn!(target: "nbd", "reply carried error {err:?}"),
                    Err(_) => warn!(target: "nbd", "reply carried unknown error code {}", reply.error),
                }
                self.disable(sched, upstream, Errno::EIO);
                return;
            }

            let matched = self
                .sent
                .iter_indices(&self.slots)
                .into_iter()
                .find(|&i| self.slots[i].handle == reply.handle);
            let Some(idx) = matched else {
                warn!(target: "nbd", "reply for unknown handle");
                self.disable(sched, upstream, Errno::EIO);
                return;
            };
            self.current_reply_req = Some(idx);
        }

        let idx = self.current_reply_req.expect("set above");
        let typ = self.slots[idx].typ;

        let mut deferred_disable = false;
        let mut finished = false;
        match typ {
            Cmd::READ => {
                let body_len = self.slots[idx].body.len();
                let progress = read_into(fd, &mut self.slots[idx].body, body_len, &mut self.slots[idx].body_cursor);
                match progress {
                    Ok(Progress::NotDone) => return,
                    Err(e) => {
                        self.disable(sched, upstream, e);
                        return;
                    }
                    Ok(Progress::Done) => finished = true,
                }
            }
            Cmd::WRITE => finished = true,
            Cmd::DISC => {
                // DISC never reaches the sent list (see `on_writable`), so a
                // matched reply of this type cannot happen in practice.
                deferred_disable = true;
                finished = true;
            }
        }

        if finished {
            debug!(target: "nbd", "completed handle {:?} type {:?}", self.slots[idx].handle, typ);
            self.sent.remove(&mut self.slots, idx);
            let tag = self.slots[idx].tag;
            let body = std::mem::take(&mut self.slots[idx].body);
            self.free.push_back(&mut self.slots, idx);
            self.nr_free += 1;
            self.current_reply_cursor = 0;
            self.current_reply_req = None;

            if !deferred_disable {
                upstream.td_complete_request(tag, body, Ok(()));
            } else {
                upstream.td_complete_request(tag, body, Err(Errno::EIO));
            }
        }

        if deferred_disable {
            self.disable(sched, upstream, Errno::EIO);
        }
    }

    /// Terminal transition: unregisters both callbacks and completes every
    /// slot still on `sent` and then `pending` with `err`. Does not touch
    /// `free`. Idempotent — a second call on an already-dead connection is a
    /// no-op.
    pub fn disable(&mut self, sched: &mut dyn Scheduler, upstream: &mut dyn Upstream, err: Errno) {
        if self.state == ConnState::Dead {
            return;
        }
        if let Some(id) = self.writer_event.take() {
            sched.unregister_event(id);
        }
        if let Some(id) = self.reader_event.take() {
            sched.unregister_event(id);
        }

        for idx in self.sent.iter_indices(&self.slots) {
            let tag = self.slots[idx].tag;
            let typ = self.slots[idx].typ;
            let handle = self.slots[idx].handle;
            let body = std::mem::take(&mut self.slots[idx].body);
            warn!(target: "nbd", "disabling: dropping sent handle {handle:?} type {typ:?} len {}", body.len());
            upstream.td_complete_request(tag, body, Err(err));
        }
        for idx in self.pending.iter_indices(&self.slots) {
            let tag = self.slots[idx].tag;
            let typ = self.slots[idx].typ;
            let handle = self.slots[idx].handle;
            let body = std::mem::take(&mut self.slots[idx].body);
            warn!(target: "nbd", "disabling: dropping pending handle {handle:?} type {typ:?} len {}", body.len());
            upstream.td_complete_request(tag, body, Err(err));
        }

        self.state = ConnState::Dead;
    }
}

/// Shared body of `write_some`/non-blocking-write over a slot's owned
/// buffer, addressed by a persistent cursor field rather than a fresh
/// [`Cursor`] each call.
fn write_from(
    fd: BorrowedFd,
    buf: &mut [u8],
    len: usize,
    so_far: &mut usize,
) -> nix::Result<Progress> {
    if *so_far >= len {
        return Ok(Progress::Done);
    }
    let mut cur = Cursor::resume(&mut buf[..len], *so_far);
    let result = write_some(fd, &mut cur);
    *so_far = cur.so_far();
    result
}

fn read_into(
    fd: BorrowedFd,
    buf: &mut [u8],
    len: usize,
    so_far: &mut usize,
) -> nix::Result<Progress> {
    if *so_far >= len {
        return Ok(Progress::Done);
    }
    let mut cur = Cursor::resume(&mut buf[..len], *so_far);
    let result = read_some(fd, &mut cur);
    *so_far = cur.so_far();
    result
}
