//! A small process-wide table handing already-connected sockets from a
//! sibling process (the out-of-scope fd receiver) to whichever `open(name)`
//! call claims them.
use std::os::fd::OwnedFd;
use std::sync::Mutex;

use log::warn;
use once_cell::sync::Lazy;

/// Capacity of the stash: how many handed-off sockets can wait unclaimed at
/// once.
pub const N_PASSED_FDS: usize = 10;

struct Slot {
    id: Option<String>,
    fd: Option<OwnedFd>,
}

impl Slot {
    const fn empty() -> Self {
        Slot { id: None, fd: None }
    }
}

/// Fixed-capacity `id -> fd` table. Collision policy favors replacement: a
/// `stash` for an id that already occupies a slot evicts (closes) whatever
/// fd was there.
pub(crate) struct FdStash {
    slots: [Slot; N_PASSED_FDS],
}

impl FdStash {
    const fn new() -> Self {
        // `Slot` has no `Copy`/`Default` we want to rely on for array-init,
        // so spell out the repeat explicitly.
        FdStash {
            slots: [
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
                Slot::empty(),
            ],
        }
    }

    /// Deposits `fd` under `id`. Picks the first slot whose id matches (by
    /// prefix, up to 39 bytes) or, failing that, the first empty slot; any
    /// fd already occupying the chosen slot is dropped (closed). If no slot
    /// qualifies, `fd` is dropped and a warning logged.
    pub fn stash(&mut self, fd: OwnedFd, id: &str) {
        let id39 = &id[..id.len().min(39)];
        let idx = self
            .slots
            .iter()
            .position(|s| s.id.as_deref().map(|existing| existing == id39).unwrap_or(false))
            .or_else(|| self.slots.iter().position(|s| s.fd.is_none()));

        match idx {
            Some(i) => {
                self.slots[i].id = Some(id39.to_string());
                self.slots[i].fd = Some(fd); // old fd, if any, drops here
            }
            None => {
                warn!(target: "nbd", "fd stash full, dropping fd for {id}");
            }
        }
    }

    /// Takes the fd stored under `id`, if any, leaving the slot tagged but
    /// empty. Returns `None` on a miss.
    pub fn retrieve(&mut self, id: &str) -> Option<OwnedFd> {
        let id39 = &id[..id.len().min(39)];
        self.slots
            .iter_mut()
            .find(|s| s.id.as_deref() == Some(id39))
            .and_then(|s| s.fd.take())
    }

    /// Hands a socket back to the stash under `id`, same placement policy as
    /// [`Self::stash`]. Used by `close` so a future `open` of the same name
    /// can reuse the connection.
    pub fn park(&mut self, fd: OwnedFd, id: &str) {
        self.stash(fd, id)
    }
}

static STASH: Lazy<Mutex<FdStash>> = Lazy::new(|| Mutex::new(FdStash::new()));

/// Process-wide stash instance. The engine itself is single-threaded per
/// connection, but `open`/`close` of independent connections may run
/// concurrently, so the table is guarded by a mutex.
pub(crate) fn global() -> &'static Mutex<FdStash> {
    &STASH
}
