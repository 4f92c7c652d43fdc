//! NBD wire protocol constants and struct definitions.
//!
//! Covers both handshake variants (OLD-style and NEW-style with
//! `NBD_FLAG_C_NO_ZEROES`) and the transmission-phase request/reply headers.
//! All multi-byte integers are big-endian, per
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use std::error::Error;
use std::fmt;
use std::io::prelude::*;

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::bail;
use color_eyre::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ASCII `"NBDMAGIC"`, the first 8 bytes of every handshake.
pub(crate) const MAGIC: u64 = 0x4e42444d41474943;
/// Second magic of the OLD-style handshake.
pub(crate) const OLD_MAGIC: u64 = 0x00420281861253;
/// ASCII `"IHAVEOPT"`, second magic of the NEW-style handshake.
pub(crate) const IHAVEOPT: u64 = 0x49484156454F5054;

pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Number of trailing zero pad bytes in the OLD-style preamble.
pub(crate) const OLD_STYLE_PAD: usize = 124;

/// Size in bytes of an encoded [`RequestHeader`].
pub(crate) const REQUEST_HEADER_LEN: usize = 28;
/// Size in bytes of an encoded [`ReplyHeader`].
pub(crate) const REPLY_HEADER_LEN: usize = 16;
/// Length of a request/reply handle.
pub(crate) const HANDLE_LEN: usize = 8;

#[derive(Debug, Clone)]
pub(crate) struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)
    }
}

impl Error for ProtocolError {}

bitflags! {
    /// Server-advertised handshake flags (NEW-style only).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 0b01;
        const NO_ZEROES = 0b10;
    }

    /// Client-advertised handshake flags (NEW-style only).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ClientHandshakeFlags: u32 {
        const C_FIXED_NEWSTYLE = 0b01;
        const C_NO_ZEROES = 0b10;
    }
}

/// The single NEW-style option this client ever sends.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum OptType {
    EXPORT_NAME = 1,
}

/// Builder/sender for a NEW-style option request (`IHAVEOPT` + type + data).
#[must_use]
pub(crate) struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        // C: 64 bits, 0x49484156454F5054 ("IHAVEOPT")
        // C: 32 bits, option
        // C: 32 bits, length of option data
        // C: option data
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// Export size and transmission flags as returned by an `EXPORT_NAME` reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportInfo {
    pub size: u64,
    pub transmit_flags: u16,
}

impl ExportInfo {
    /// Reads the 10-byte NO_ZEROES-style export info reply (no trailing pad).
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let size = stream.read_u64::<BE>()?;
        let transmit_flags = stream.read_u16::<BE>()?;
        Ok(Self { size, transmit_flags })
    }
}

/// Size and flags from an OLD-style preamble, after the 124-byte pad has been
/// drained.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OldStyleInfo {
    pub size: u64,
    pub flags: u32,
}

impl OldStyleInfo {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let size = stream.read_u64::<BE>()?;
        let flags = stream.read_u32::<BE>()?;
        let mut pad = [0u8; OLD_STYLE_PAD];
        stream.read_exact(&mut pad)?;
        Ok(Self { size, flags })
    }
}

// -------------------
// Transmission phase
// -------------------

/// Command types this driver ever places on the wire. Any other reply type is
/// rejected (see [`Cmd::try_from`] call sites).
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum Cmd {
    READ = 0,
    WRITE = 1,
    DISC = 2,
}

/// A 28-byte NBD request header, pre-encoded into network byte order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestHeader {
    pub typ: Cmd,
    pub handle: [u8; HANDLE_LEN],
    pub offset: u64,
    pub length: u32,
}

impl RequestHeader {
    pub fn new(typ: Cmd, handle: [u8; HANDLE_LEN], offset: u64, length: u32) -> Self {
        Self { typ, handle, offset, length }
    }

    /// Encodes this header into its 28-byte wire form.
    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        {
            let mut w: &mut [u8] = &mut buf;
            w.write_u32::<BE>(REQUEST_MAGIC).unwrap();
            w.write_u16::<BE>(0).unwrap(); // command flags, always empty
            w.write_u16::<BE>(u16::from(self.typ)).unwrap();
            w.write_all(&self.handle).unwrap();
            w.write_u64::<BE>(self.offset).unwrap();
            w.write_u32::<BE>(self.length).unwrap();
        }
        buf
    }

    /// Decodes a request header, used only by the test-only mock server.
    #[cfg(test)]
    pub fn decode(buf: &[u8; REQUEST_HEADER_LEN]) -> Result<Self> {
        let mut r: &[u8] = buf;
        let magic = r.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError::new(format!("wrong request magic {magic}")));
        }
        let _flags = r.read_u16::<BE>()?;
        let typ = r.read_u16::<BE>()?;
        let typ =
            Cmd::try_from(typ).map_err(|_| ProtocolError::new(format!("unexpected command {typ}")))?;
        let mut handle = [0u8; HANDLE_LEN];
        r.read_exact(&mut handle)?;
        let offset = r.read_u64::<BE>()?;
        let length = r.read_u32::<BE>()?;
        Ok(Self { typ, handle, offset, length })
    }
}

/// Error code carried in an NBD reply header. Only `OK` vs. non-zero matters
/// to the engine; the rest is decoded for logging.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ErrorType {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

/// A 16-byte NBD simple reply header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplyHeader {
    pub error: u32,
    pub handle: [u8; HANDLE_LEN],
}

impl ReplyHeader {
    /// Decodes a reply header from its 16-byte wire form.
    pub fn decode(buf: &[u8; REPLY_HEADER_LEN]) -> Result<Self> {
        let mut r: &[u8] = buf;
        let magic = r.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError::new(format!("wrong reply magic {magic}")));
        }
        let error = r.read_u32::<BE>()?;
        let mut handle = [0u8; HANDLE_LEN];
        r.read_exact(&mut handle)?;
        Ok(Self { error, handle })
    }

    /// Encodes a reply header, used only by the test-only mock server.
    #[cfg(test)]
    pub fn encode(&self) -> [u8; REPLY_HEADER_LEN] {
        let mut buf = [0u8; REPLY_HEADER_LEN];
        let mut w: &mut [u8] = &mut buf;
        w.write_u32::<BE>(SIMPLE_REPLY_MAGIC).unwrap();
        w.write_u32::<BE>(self.error).unwrap();
        w.write_all(&self.handle).unwrap();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_round_trips_through_encode_and_decode() {
        let handle = *b"td00042\0";
        let header = RequestHeader::new(Cmd::WRITE, handle, 0x1000, 512);
        let decoded = RequestHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.typ, Cmd::WRITE);
        assert_eq!(decoded.handle, handle);
        assert_eq!(decoded.offset, 0x1000);
        assert_eq!(decoded.length, 512);
    }

    #[test]
    fn request_header_decode_rejects_wrong_magic() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[3] = 0xFF; // corrupt the low byte of REQUEST_MAGIC
        assert!(RequestHeader::decode(&buf).is_err());
    }

    #[test]
    fn reply_header_round_trips_through_decode_and_encode() {
        // The mock test server in tests/support builds replies by hand; this
        // exercises the same encode/decode pair from the other direction,
        // via a server-authored ReplyHeader instead of raw bytes.
        let original = ReplyHeader { error: 0, handle: *b"td00099\0" };
        let reencoded = ReplyHeader::decode(&original.encode()).unwrap();
        assert_eq!(reencoded.error, original.error);
        assert_eq!(reencoded.handle, original.handle);
    }
}
