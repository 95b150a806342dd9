//! Bounded-retry read/write helpers for the wire codec.
//!
//! `read_full`/`write_full` retry on `ErrorKind::Interrupted` and treat a
//! short read of zero bytes as peer shutdown rather than an error.

use std::io::{self, ErrorKind, Read, Write};

/// Fills `buf` completely, retrying on `EINTR`.
///
/// Returns `Ok(true)` once `buf` is full, `Ok(false)` if the peer closed the
/// connection before any bytes were read (clean EOF), and `Err` otherwise.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed connection mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Writes all of `buf`, retrying on `EINTR`.
pub fn write_full<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match writer.write(&buf[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "peer closed connection during write",
                ))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
