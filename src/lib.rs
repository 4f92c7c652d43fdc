//! Asynchronous NBD client driver for a user-space virtual-disk I/O daemon.
//!
//! The core translates block-layer read/write requests into the NBD wire
//! protocol over a single non-blocking socket, driven entirely by the
//! embedding event loop through the [`engine::Scheduler`]/[`engine::Upstream`]
//! collaborator traits. See [`driver::Driver`] for the entry point.
pub mod driver;
pub(crate) mod engine;
pub(crate) mod fdstash;
pub(crate) mod handshake;
pub(crate) mod proto;
pub(crate) mod transport;

pub use driver::{stash_fd, BlockRequest, Driver, OpenFlags, NO_PARENT};
pub use engine::{EventMode, Scheduler, Upstream, MAX_NBD_REQS};
pub use fdstash::N_PASSED_FDS;
pub use handshake::ExportGeometry;
