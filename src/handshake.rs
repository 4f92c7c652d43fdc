//! Blocking handshake negotiator, run exactly once per connection before the
//! socket is flipped to non-blocking for the transmission phase.
use std::io::prelude::*;
use std::time::Instant;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::bail;
use color_eyre::Result;
use log::info;

use crate::proto::*;
use crate::transport::{Socket, TimedIo};

/// `size_in_sectors`/`sector_size` learned from a successful handshake.
#[derive(Debug, Clone, Copy)]
pub struct ExportGeometry {
    pub size_in_sectors: u64,
    pub sector_size: u32,
}

/// Runs the handshake over `socket`, which must still be in blocking mode.
/// The whole negotiation — both magics, the OLD-style size/flags/pad, and
/// the NEW-style flags/option/export-info round trip — runs through a
/// single [`TimedIo`] bounded by one shared `HANDSHAKE_TIMEOUT` deadline, so
/// a peer that stalls or backpressures at any step fails `open` instead of
/// hanging it forever.
pub(crate) fn negotiate(socket: &mut Socket, export_name: &str) -> Result<ExportGeometry> {
    let deadline = Instant::now() + crate::driver::HANDSHAKE_TIMEOUT;
    let mut io = TimedIo::new(socket, deadline);

    let magic = io.read_u64::<BE>()?;
    if magic != MAGIC {
        bail!(ProtocolError::new(format!("unexpected magic {magic:#x}")));
    }

    let second_magic = io.read_u64::<BE>()?;
    let geometry = if second_magic == OLD_MAGIC {
        old_style(&mut io)?
    } else if second_magic == IHAVEOPT {
        new_style(&mut io, export_name)?
    } else {
        bail!(ProtocolError::new(format!(
            "unrecognized second magic {second_magic:#x}"
        )));
    };

    info!(target: "nbd", "handshake finished: {} sectors of {} bytes", geometry.size_in_sectors, geometry.sector_size);
    Ok(geometry)
}

fn old_style(mut stream: impl Read) -> Result<ExportGeometry> {
    let info = OldStyleInfo::get(&mut stream)?;
    info!(target: "nbd", "OLD-style handshake: size={} flags={:#x}", info.size, info.flags);
    Ok(ExportGeometry {
        size_in_sectors: info.size >> 9,
        sector_size: 512,
    })
}

fn new_style(mut stream: impl Read + Write, export_name: &str) -> Result<ExportGeometry> {
    let server_flags = stream.read_u16::<BE>()?;
    let server_flags = HandshakeFlags::from_bits(server_flags)
        .ok_or_else(|| ProtocolError::new(format!("unexpected server flags {server_flags}")))?;
    if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
        bail!(ProtocolError::new("server does not support fixed newstyle"));
    }

    let client_flags = ClientHandshakeFlags::C_FIXED_NEWSTYLE | ClientHandshakeFlags::C_NO_ZEROES;
    stream.write_u32::<BE>(client_flags.bits())?;
    stream.flush()?;

    Opt {
        typ: OptType::EXPORT_NAME,
        data: export_name.as_bytes().to_vec(),
    }
    .put(&mut stream)?;

    let info = ExportInfo::get(&mut stream)?;
    info!(target: "nbd", "NEW-style handshake: size={} xflags={:#x}", info.size, info.transmit_flags);
    Ok(ExportGeometry {
        size_in_sectors: info.size >> 9,
        sector_size: 512,
    })
}
