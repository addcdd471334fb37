//! MySQL client/server packet framing.
//!
//! Every packet on the wire is framed as:
//!
//! ```text
//! Bytes  Name
//! -----  ----
//! 3      payload length (little endian)
//! 1      sequence number
//! n      payload
//! ```
//!
//! Payloads of `0xffffff` bytes continue in the next frame.

use crate::channel::SocketChannel;
use crate::error::Result;

pub const MAX_PACKET_LEN: usize = 0x00ff_ffff;

/// Reads one logical packet, reassembling oversized payloads.
/// Returns the payload and the last frame's sequence number.
pub fn read_packet(ch: &mut dyn SocketChannel) -> Result<(Vec<u8>, u8)> {
    let mut body = Vec::new();
    let mut seq;
    loop {
        let mut header = [0u8; 4];
        ch.read_exact(&mut header)?;
        let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
        seq = header[3];
        let start = body.len();
        body.resize(start + len, 0);
        ch.read_exact(&mut body[start..])?;
        if len < MAX_PACKET_LEN {
            break;
        }
    }
    Ok((body, seq))
}

/// Writes one logical packet, splitting payloads of `0xffffff` bytes or
/// more into continuation frames.
pub fn write_packet(ch: &mut dyn SocketChannel, seq: u8, body: &[u8]) -> Result<()> {
    let mut seq = seq;
    let mut rest = body;
    loop {
        let chunk = if rest.len() >= MAX_PACKET_LEN {
            &rest[..MAX_PACKET_LEN]
        } else {
            rest
        };
        let len = chunk.len();
        let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, seq];
        ch.write_all(&header)?;
        ch.write_all(chunk)?;
        seq = seq.wrapping_add(1);
        rest = &rest[len..];
        if len < MAX_PACKET_LEN {
            break;
        }
    }
    Ok(())
}
